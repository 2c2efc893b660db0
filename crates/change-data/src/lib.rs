//! Change-detection data handling crate

pub mod dataset;
pub mod errors;
pub mod raster;

pub use dataset::{ChangeDetectionDataset, ChangeSample, DatasetConfig, SampleEntry};
pub use errors::{DatasetError, Result};
pub use raster::{load_image, load_label, save_change_map, ImageTensor, LabelMap, Normalization};
