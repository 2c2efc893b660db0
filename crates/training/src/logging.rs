use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::{config::LoggingConfig, epoch::EpochLog, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl From<&LoggingConfig> for LoggingSettings {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

/// What happened in one orchestrator iteration.
#[derive(Debug, Clone, Copy)]
pub struct EpochRecord<'a> {
    pub epoch: usize,
    pub total_epochs: usize,
    pub learning_rate: f64,
    pub train: &'a EpochLog,
    pub valid: &'a EpochLog,
    pub monitored: &'a str,
    pub best_score: f64,
    pub improved: bool,
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    /// Logger that prints nothing and writes no event file.
    pub fn silent() -> Self {
        Self {
            settings: LoggingSettings {
                enable_stdout: false,
                tensorboard_dir: None,
                tensorboard_flush_every_n: 1,
            },
            tensorboard: None,
        }
    }

    pub fn tensorboard_path(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_epoch(&mut self, record: &EpochRecord<'_>) {
        if self.settings.enable_stdout {
            println!(
                "epoch {}/{} lr={:.3e} | train {} | valid {} | best_{}={:.4}{}",
                record.epoch,
                record.total_epochs,
                record.learning_rate,
                record.train,
                record.valid,
                record.monitored,
                record.best_score,
                if record.improved { " (saved)" } else { "" }
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = record.epoch as i64;
            let mut scalars = vec![("train/learning_rate".to_string(), record.learning_rate)];
            scalars.extend(record.train.iter().map(|(k, v)| (format!("train/{k}"), v)));
            scalars.extend(record.valid.iter().map(|(k, v)| (format!("valid/{k}"), v)));
            scalars.push((format!("valid/best_{}", record.monitored), record.best_score));
            if let Err(err) = writer.write_scalars(step, &scalars) {
                eprintln!("[training] tensorboard logging disabled: {err}");
                self.tensorboard = None;
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    /// One event per epoch carrying every scalar of that epoch.
    fn write_scalars(&mut self, step: i64, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: scalars
                    .iter()
                    .map(|(tag, value)| summary::Value {
                        tag: tag.clone(),
                        simple_value: Some(*value as f32),
                    })
                    .collect(),
            }),
        };
        let record = frame_record(&event);
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: little-endian u64 length, masked CRC-32C of the length,
/// payload, masked CRC-32C of the payload.
fn frame_record(event: &Event) -> Bytes {
    let payload = event.encode_to_vec();
    let len_bytes = (payload.len() as u64).to_le_bytes();

    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len_bytes);
    record.put_u32_le(masked_crc32c(&len_bytes));
    record.put_slice(&payload);
    record.put_u32_le(masked_crc32c(&payload));
    record.freeze()
}

fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_crc_uses_castagnoli_polynomial() {
        // CRC-32C check value 0xE3069283 and the RFC 3720 all-zero vector, masked.
        assert_eq!(masked_crc32c(b"123456789"), 0xc78a_b0e5);
        let zeros = 0x8a91_36aa_u32;
        let expected = ((zeros >> 15) | (zeros << 17)).wrapping_add(0xa282_ead8);
        assert_eq!(masked_crc32c(&[0u8; 32]), expected);
    }

    #[test]
    fn records_are_framed_with_masked_crcs() {
        let event = Event {
            wall_time: 1.5,
            step: 3,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: "valid/fscore".into(),
                    simple_value: Some(0.75),
                }],
            }),
        };
        let record = frame_record(&event);

        let len = u64::from_le_bytes(record[..8].try_into().unwrap()) as usize;
        assert_eq!(record.len(), len + 16);
        let len_crc = u32::from_le_bytes(record[8..12].try_into().unwrap());
        assert_eq!(len_crc, masked_crc32c(&record[..8]));

        let payload = &record[12..12 + len];
        let data_crc = u32::from_le_bytes(record[12 + len..].try_into().unwrap());
        assert_eq!(data_crc, masked_crc32c(payload));
        assert_eq!(Event::decode(payload).unwrap(), event);
    }

    #[test]
    fn writes_event_file_into_configured_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(tmp.path().join("tb")),
            tensorboard_flush_every_n: 1,
        };
        let logger = Logger::new(settings).unwrap();
        let path = logger.tensorboard_path().unwrap().to_path_buf();
        assert!(path.starts_with(tmp.path().join("tb")));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("events.out.tfevents."));
    }
}
