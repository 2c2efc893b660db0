use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device};
use hex::encode as hex_encode;
use model::{snapshot_parameters, ChangeDetector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const DEFAULT_CHECKPOINT_NAME: &str = "best_model";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Sidecar describing the snapshot currently on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    pub metric: String,
    pub score: f64,
    pub weights: FileRecord,
}

/// Keeps the single best-scoring snapshot of a model.
///
/// The score starts at 0.0 and only moves up: a candidate is saved when it is
/// strictly greater than the current best. The snapshot is fully written
/// before the in-memory best changes, so a failed write leaves the previous
/// best (on disk and in memory) intact.
#[derive(Debug)]
pub struct BestCheckpoint {
    directory: PathBuf,
    name: String,
    metric: String,
    best_score: f64,
    best_epoch: Option<usize>,
    saves: usize,
}

impl BestCheckpoint {
    pub fn new(directory: impl Into<PathBuf>, metric: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: DEFAULT_CHECKPOINT_NAME.to_string(),
            metric: metric.into(),
            best_score: 0.0,
            best_epoch: None,
            saves: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn weights_path(&self) -> PathBuf {
        self.directory.join(format!("{}.safetensors", self.name))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(format!("{}.json", self.name))
    }

    /// Persists `model` if `score` beats the best so far. Returns whether it did.
    pub fn consider<M>(&mut self, score: f64, model: &M, epoch: usize) -> Result<bool, TrainingError>
    where
        M: ChangeDetector + ?Sized,
    {
        // NaN compares false and never improves.
        if !(score > self.best_score) {
            return Ok(false);
        }

        self.persist(score, model, epoch)?;
        self.best_score = score;
        self.best_epoch = Some(epoch);
        self.saves += 1;
        println!(
            "[training] new best {}={:.4} at epoch {}; saved {}",
            self.metric,
            score,
            epoch,
            self.weights_path().display()
        );
        Ok(true)
    }

    /// Overwrites `model`'s parameters with the saved snapshot.
    /// Returns `false` when nothing has been saved yet.
    pub fn load_best_weights<M>(&self, model: &M) -> Result<bool, TrainingError>
    where
        M: ChangeDetector + ?Sized,
    {
        if self.best_epoch.is_none() {
            return Ok(false);
        }
        let manifest = read_json::<CheckpointManifest>(&self.manifest_path())?;
        ensure_version_supported(manifest.version)?;
        let weights = self.directory.join(&manifest.weights.filename);
        validate_file(&weights, &manifest.weights.sha256)?;
        apply_model_weights(model, &weights)?;
        Ok(true)
    }

    fn persist<M>(&self, score: f64, model: &M, epoch: usize) -> Result<(), TrainingError>
    where
        M: ChangeDetector + ?Sized,
    {
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let weights_path = self.weights_path();
        let tmp_weights = with_suffix(&weights_path, ".tmp");
        let tensors = snapshot_parameters(model).map_err(candle_to_training_error)?;
        candle_core::safetensors::save(&tensors, &tmp_weights).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                tmp_weights.display()
            ))
        })?;
        let mut weights = file_record(&tmp_weights)?;
        weights.filename = file_name(&weights_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            epoch,
            metric: self.metric.clone(),
            score,
            weights,
        };
        let manifest_path = self.manifest_path();
        let tmp_manifest = with_suffix(&manifest_path, ".tmp");
        write_json(&tmp_manifest, &manifest)?;

        commit(&tmp_weights, &weights_path, &tmp_manifest, &manifest_path)
    }
}

/// Moves the staged files into place, manifest last. If either rename
/// fails the previous weights are put back and the staged files removed.
fn commit(
    tmp_weights: &Path,
    weights_path: &Path,
    tmp_manifest: &Path,
    manifest_path: &Path,
) -> Result<(), TrainingError> {
    let backup = weights_path
        .is_file()
        .then(|| with_suffix(weights_path, ".bak"));
    if let Some(backup) = backup.as_deref() {
        if let Err(err) = rename(weights_path, backup) {
            discard(&[tmp_weights, tmp_manifest]);
            return Err(err);
        }
    }

    let outcome =
        rename(tmp_weights, weights_path).and_then(|()| rename(tmp_manifest, manifest_path));
    match (outcome, backup) {
        (Ok(()), Some(backup)) => {
            discard(&[backup.as_path()]);
            Ok(())
        }
        (Ok(()), None) => Ok(()),
        (Err(err), backup) => {
            discard(&[tmp_weights, tmp_manifest, weights_path]);
            if let Some(backup) = backup {
                if let Err(restore) = rename(&backup, weights_path) {
                    eprintln!("[training] failed to restore previous weights: {restore}");
                }
            }
            Err(err)
        }
    }
}

fn discard(paths: &[&Path]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

pub fn read_manifest(directory: &Path, name: &str) -> Result<CheckpointManifest, TrainingError> {
    let path = directory.join(format!("{name}.json"));
    if !path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&path)?;
    ensure_version_supported(manifest.version)?;
    Ok(manifest)
}

/// Loads a safetensors snapshot into `model`. Every parameter must be present
/// with a matching shape and the file may not carry extra tensors.
pub fn apply_model_weights<M>(model: &M, weights_path: &Path) -> Result<(), TrainingError>
where
    M: ChangeDetector + ?Sized,
{
    let tensors = load_safetensors(weights_path, &Device::Cpu).map_err(candle_to_training_error)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let current = var.as_tensor();
        if tensor.dims() != current.dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                current.dims()
            )));
        }
        let tensor = tensor
            .to_dtype(current.dtype())
            .and_then(|t| t.to_device(current.device()))
            .map_err(candle_to_training_error)?;
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_name(path: &Path) -> Result<String, TrainingError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    Ok(FileRecord {
        filename: file_name(path)?,
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
