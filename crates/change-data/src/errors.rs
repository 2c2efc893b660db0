use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("sample {name} is missing its {kind} file at {path}")]
    MissingCounterpart {
        name: String,
        kind: &'static str,
        path: PathBuf,
    },

    #[error("shape mismatch in sample {name}: {detail}")]
    Shape { name: String, detail: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sample index {index} out of range for {len} samples")]
    OutOfRange { index: usize, len: usize },
}
