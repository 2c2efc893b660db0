pub mod checkpoint;
pub mod config;
pub mod data;
pub mod epoch;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod scheduler;
pub mod trainer;
pub mod visualize;

pub use checkpoint::{apply_model_weights, read_manifest, BestCheckpoint, CheckpointManifest};
pub use config::{TrainingConfig, TrainingError};
pub use data::{BlockingDataLoader, ChangeBatch, ChangeDetectionLoader, DataLoader, InMemoryLoader};
pub use epoch::{EpochLog, EpochRunner, RunMode};
pub use logging::{Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossOutput};
pub use metrics::{ConfusionMetric, EpochMeter, Metric};
pub use optimizer::{OptimizerConfig, TrainerOptimizer};
pub use scheduler::{EpochScheduler, LRScheduler, Schedule};
pub use trainer::{Trainer, TrainerParts, TrainerState, TrainingReport, VisualizationPlan};
