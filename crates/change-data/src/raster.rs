//! Decoding of image and annotation rasters into flat, channel-first buffers.

use std::path::Path;

use image::{DynamicImage, GrayImage};

use crate::errors::{DatasetError, Result};

/// Per-channel normalisation applied as `(pixel / 255 - mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// ImageNet statistics for RGB inputs.
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }

    /// Scales pixels to `[0, 1]` without centring.
    pub fn unit(channels: usize) -> Self {
        Self {
            mean: vec![0.0; channels],
            std: vec![1.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.mean.is_empty() {
            return Err(DatasetError::InvalidConfig(
                "normalization requires at least one channel".into(),
            ));
        }
        if self.mean.len() != self.std.len() {
            return Err(DatasetError::InvalidConfig(format!(
                "normalization mean has {} channels but std has {}",
                self.mean.len(),
                self.std.len()
            )));
        }
        if !matches!(self.mean.len(), 1 | 3) {
            return Err(DatasetError::InvalidConfig(format!(
                "only 1 or 3 channel images are supported (got {})",
                self.mean.len()
            )));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(DatasetError::InvalidConfig(
                "normalization std values must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Normalised image stored channel-first (`C, H, W`).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Binary change mask (`H, W`), 1 marks a changed pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    pub data: Vec<u32>,
    pub height: usize,
    pub width: usize,
}

impl LabelMap {
    pub fn changed_pixels(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

pub fn load_image(path: &Path, normalization: &Normalization) -> Result<ImageTensor> {
    let decoded = open(path)?;
    let width = decoded.width() as usize;
    let height = decoded.height() as usize;
    let channels = normalization.channels();
    let raw = match channels {
        1 => decoded.to_luma8().into_raw(),
        _ => decoded.to_rgb8().into_raw(),
    };

    let plane = height * width;
    let mut data = vec![0f32; channels * plane];
    for (idx, value) in raw.iter().enumerate() {
        let pixel = idx / channels;
        let channel = idx % channels;
        let scaled = *value as f32 / 255.0;
        data[channel * plane + pixel] =
            (scaled - normalization.mean[channel]) / normalization.std[channel];
    }

    Ok(ImageTensor {
        data,
        channels,
        height,
        width,
    })
}

/// Reads an annotation raster; any non-zero grey level counts as change.
pub fn load_label(path: &Path) -> Result<LabelMap> {
    let decoded = open(path)?.to_luma8();
    let width = decoded.width() as usize;
    let height = decoded.height() as usize;
    let data = decoded
        .into_raw()
        .into_iter()
        .map(|v| u32::from(v > 0))
        .collect();
    Ok(LabelMap {
        data,
        height,
        width,
    })
}

/// Writes a predicted change map as an 8-bit PNG (0 = unchanged, 255 = changed).
pub fn save_change_map(path: &Path, map: &LabelMap) -> Result<()> {
    if map.data.len() != map.height * map.width {
        return Err(DatasetError::Shape {
            name: path.display().to_string(),
            detail: format!(
                "change map holds {} pixels, expected {}x{}",
                map.data.len(),
                map.height,
                map.width
            ),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pixels: Vec<u8> = map
        .data
        .iter()
        .map(|&v| if v != 0 { 255 } else { 0 })
        .collect();
    let image = GrayImage::from_raw(map.width as u32, map.height as u32, pixels).ok_or_else(|| {
        DatasetError::Shape {
            name: path.display().to_string(),
            detail: "change map buffer does not fit its dimensions".into(),
        }
    })?;
    image.save(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}
