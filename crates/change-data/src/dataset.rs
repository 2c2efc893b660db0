use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    errors::{DatasetError, Result},
    raster::{load_image, load_label, ImageTensor, LabelMap, Normalization},
};

pub const DEFAULT_DEBUG_SAMPLES: usize = 8;

/// Directory layout of a paired change-detection split.
///
/// The default matches LEVIR-CD: `<root>/A`, `<root>/B` and `<root>/label`
/// holding identically named `.png` files.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub sub_dir_1: String,
    pub sub_dir_2: String,
    pub img_suffix: String,
    /// Label directory; `<root>/label` when unset.
    pub ann_dir: Option<PathBuf>,
    /// Keep only the first `debug_samples` samples.
    pub debug: bool,
    pub debug_samples: usize,
    /// Evaluation split: samples keep their listing order.
    pub test_mode: bool,
}

impl DatasetConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sub_dir_1: "A".into(),
            sub_dir_2: "B".into(),
            img_suffix: ".png".into(),
            ann_dir: None,
            debug: false,
            debug_samples: DEFAULT_DEBUG_SAMPLES,
            test_mode: false,
        }
    }

    pub fn annotation_dir(&self) -> PathBuf {
        self.ann_dir
            .clone()
            .unwrap_or_else(|| self.root.join("label"))
    }
}

/// File locations of one pre/post/label triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    pub name: String,
    pub pre: PathBuf,
    pub post: PathBuf,
    pub label: PathBuf,
}

/// Decoded, normalised sample.
#[derive(Debug, Clone)]
pub struct ChangeSample {
    pub name: String,
    pub pre: ImageTensor,
    pub post: ImageTensor,
    pub label: LabelMap,
}

/// Indexed collection of change-detection samples, decoded lazily on [`get`](Self::get).
#[derive(Debug, Clone)]
pub struct ChangeDetectionDataset {
    config: DatasetConfig,
    normalization: Normalization,
    entries: Vec<SampleEntry>,
}

impl ChangeDetectionDataset {
    pub fn open(config: DatasetConfig, normalization: Normalization) -> Result<Self> {
        normalization.validate()?;
        if config.img_suffix.is_empty() {
            return Err(DatasetError::InvalidConfig(
                "img_suffix must not be empty".into(),
            ));
        }
        if config.debug && config.debug_samples == 0 {
            return Err(DatasetError::InvalidConfig(
                "debug_samples must be greater than zero".into(),
            ));
        }

        let mut entries = list_entries(&config)?;
        if config.debug {
            entries.truncate(config.debug_samples);
        }

        println!(
            "[change-data] {} sample(s) under {} (debug={} test_mode={})",
            entries.len(),
            config.root.display(),
            config.debug,
            config.test_mode
        );

        Ok(Self {
            config,
            normalization,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn channels(&self) -> usize {
        self.normalization.channels()
    }

    /// Training splits are shuffled by loaders; test splits are not.
    pub fn shuffle_enabled(&self) -> bool {
        !self.config.test_mode
    }

    pub fn get(&self, index: usize) -> Result<ChangeSample> {
        let entry = self.entries.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.entries.len(),
        })?;

        let pre = load_image(&entry.pre, &self.normalization)?;
        let post = load_image(&entry.post, &self.normalization)?;
        let label = load_label(&entry.label)?;

        if (pre.height, pre.width) != (post.height, post.width) {
            return Err(DatasetError::Shape {
                name: entry.name.clone(),
                detail: format!(
                    "pre image is {}x{} but post image is {}x{}",
                    pre.height, pre.width, post.height, post.width
                ),
            });
        }
        if (pre.height, pre.width) != (label.height, label.width) {
            return Err(DatasetError::Shape {
                name: entry.name.clone(),
                detail: format!(
                    "images are {}x{} but label is {}x{}",
                    pre.height, pre.width, label.height, label.width
                ),
            });
        }

        Ok(ChangeSample {
            name: entry.name.clone(),
            pre,
            post,
            label,
        })
    }
}

fn list_entries(config: &DatasetConfig) -> Result<Vec<SampleEntry>> {
    let pre_dir = config.root.join(&config.sub_dir_1);
    let post_dir = config.root.join(&config.sub_dir_2);
    let ann_dir = config.annotation_dir();

    for (dir, what) in [(&pre_dir, "sub_dir_1"), (&post_dir, "sub_dir_2"), (&ann_dir, "ann_dir")] {
        if !dir.is_dir() {
            return Err(DatasetError::InvalidConfig(format!(
                "{what} directory {} does not exist",
                dir.display()
            )));
        }
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(&pre_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(&config.img_suffix) {
            names.push(file_name);
        }
    }
    names.sort();

    names
        .into_iter()
        .map(|file_name| {
            let stem = file_name
                .strip_suffix(&config.img_suffix)
                .unwrap_or(&file_name)
                .to_string();
            Ok(SampleEntry {
                pre: pre_dir.join(&file_name),
                post: counterpart(&post_dir, &file_name, &stem, "post image")?,
                label: counterpart(&ann_dir, &file_name, &stem, "label")?,
                name: stem,
            })
        })
        .collect()
}

fn counterpart(dir: &Path, file_name: &str, stem: &str, kind: &'static str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(DatasetError::MissingCounterpart {
            name: stem.to_string(),
            kind,
            path,
        })
    }
}
