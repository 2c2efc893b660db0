use change_data::{DatasetConfig, DatasetError, Normalization};
use model::{FusionForm, ModelSpec};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::scheduler::Schedule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.in_channels == 0 {
            errors.push("model.in_channels must be greater than 0".to_string());
        }
        if self.model.classes == 0 {
            errors.push("model.classes must be greater than 0".to_string());
        }
        if let Err(err) = self.model.fusion_form.parse::<FusionForm>() {
            errors.push(format!("model.fusion_form: {err}"));
        }
        if let Err(err) = model::encoder_channels(&self.model.encoder_name) {
            errors.push(format!("model.encoder_name: {err}"));
        }
        if let Some(p) = self.model.decoder_dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push("model.decoder_dropout must be in [0, 1)".to_string());
            }
        }

        if self.data.train_batch_size == 0 {
            errors.push("data.train_batch_size must be greater than 0".to_string());
        }
        if self.data.valid_batch_size == 0 {
            errors.push("data.valid_batch_size must be greater than 0".to_string());
        }
        if self.data.mean.len() != self.data.std.len() {
            errors.push("data.mean and data.std must have the same length".to_string());
        }
        if self.data.mean.len() != self.model.in_channels {
            errors.push(format!(
                "data.mean has {} channel(s) but model.in_channels is {}",
                self.data.mean.len(),
                self.model.in_channels
            ));
        }
        if self.data.std.iter().any(|s| *s <= 0.0) {
            errors.push("data.std values must be greater than 0".to_string());
        }
        for (label, split) in [("data.train", &self.data.train), ("data.valid", &self.data.valid)] {
            if split.root.as_os_str().is_empty() {
                errors.push(format!("{label}.root must not be empty"));
            }
            if split.img_suffix.is_empty() {
                errors.push(format!("{label}.img_suffix must not be empty"));
            }
            if split.debug && split.debug_samples == 0 {
                errors.push(format!("{label}.debug_samples must be greater than 0"));
            }
        }

        if self.metrics.is_empty() {
            errors.push("metrics must list at least one metric".to_string());
        }
        for metric in &self.metrics {
            if !(0.0..=1.0).contains(&metric.threshold) {
                errors.push(format!("metric {} threshold must be in [0, 1]", metric.name()));
            }
            if metric.beta <= 0.0 {
                errors.push(format!("metric {} beta must be greater than 0", metric.name()));
            }
            if matches!(metric.activation, MetricActivation::Argmax2d) && self.model.classes < 2 {
                errors.push(format!(
                    "metric {} uses argmax2d but model.classes is {}",
                    metric.name(),
                    self.model.classes
                ));
            }
        }
        let monitored = &self.runtime.checkpoint.metric;
        if !self.metrics.iter().any(|m| m.name() == monitored) {
            errors.push(format!(
                "runtime.checkpoint.metric '{}' is not one of the configured metrics",
                monitored
            ));
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if let Err(err) = self.scheduler.schedule().validate() {
            errors.push(format!("scheduler: {err}"));
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }
        if self.runtime.checkpoint.filename.is_empty() {
            errors.push("runtime.checkpoint.filename must not be empty".to_string());
        }
        let vis = &self.runtime.visualization;
        if vis.enabled {
            if vis.window_size == 0 {
                errors.push("runtime.visualization.window_size must be greater than 0".to_string());
            }
            if vis.image_size < vis.window_size {
                errors.push(
                    "runtime.visualization.image_size cannot be smaller than window_size"
                        .to_string(),
                );
            }
            if vis.save_dir.as_os_str().is_empty() {
                errors.push("runtime.visualization.save_dir must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.model.apply_base_path(base);
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_encoder_name")]
    pub encoder_name: String,
    #[serde(default)]
    pub encoder_weights: Option<PathBuf>,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_true")]
    pub siam_encoder: bool,
    #[serde(default = "default_fusion_form")]
    pub fusion_form: String,
    #[serde(default)]
    pub decoder_dropout: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder_name: default_encoder_name(),
            encoder_weights: None,
            in_channels: default_in_channels(),
            classes: default_classes(),
            siam_encoder: true,
            fusion_form: default_fusion_form(),
            decoder_dropout: None,
        }
    }
}

impl ModelConfig {
    pub fn to_spec(&self) -> Result<ModelSpec, TrainingError> {
        let fusion_form = self
            .fusion_form
            .parse::<FusionForm>()
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        Ok(ModelSpec {
            encoder_name: self.encoder_name.clone(),
            encoder_weights: self.encoder_weights.clone(),
            in_channels: self.in_channels,
            classes: self.classes,
            siam_encoder: self.siam_encoder,
            fusion_form,
            decoder_dropout: self.decoder_dropout,
        })
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.encoder_weights.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_train_split")]
    pub train: SplitConfig,
    #[serde(default = "default_valid_split")]
    pub valid: SplitConfig,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_valid_batch_size")]
    pub valid_batch_size: usize,
    #[serde(default)]
    pub drop_last: bool,
    #[serde(default = "default_mean")]
    pub mean: Vec<f32>,
    #[serde(default = "default_std")]
    pub std: Vec<f32>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train: default_train_split(),
            valid: default_valid_split(),
            train_batch_size: default_train_batch_size(),
            valid_batch_size: default_valid_batch_size(),
            drop_last: false,
            mean: default_mean(),
            std: default_std(),
        }
    }
}

impl DataConfig {
    pub fn normalization(&self) -> Normalization {
        Normalization {
            mean: self.mean.clone(),
            std: self.std.clone(),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.train.apply_base_path(base);
        self.valid.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub root: PathBuf,
    #[serde(default = "default_sub_dir_1")]
    pub sub_dir_1: String,
    #[serde(default = "default_sub_dir_2")]
    pub sub_dir_2: String,
    #[serde(default = "default_img_suffix")]
    pub img_suffix: String,
    #[serde(default)]
    pub ann_dir: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_debug_samples")]
    pub debug_samples: usize,
    #[serde(default)]
    pub test_mode: bool,
}

impl SplitConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sub_dir_1: default_sub_dir_1(),
            sub_dir_2: default_sub_dir_2(),
            img_suffix: default_img_suffix(),
            ann_dir: None,
            debug: false,
            debug_samples: default_debug_samples(),
            test_mode: false,
        }
    }

    pub fn to_dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            root: self.root.clone(),
            sub_dir_1: self.sub_dir_1.clone(),
            sub_dir_2: self.sub_dir_2.clone(),
            img_suffix: self.img_suffix.clone(),
            ann_dir: self.ann_dir.clone(),
            debug: self.debug,
            debug_samples: self.debug_samples,
            test_mode: self.test_mode,
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.root, base);
        if let Some(ann_dir) = self.ann_dir.as_mut() {
            absolutize_in_place(ann_dir, base);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub ignore_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Fscore,
    Precision,
    Recall,
    Iou,
    Accuracy,
}

impl MetricKind {
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Fscore => "fscore",
            MetricKind::Precision => "precision",
            MetricKind::Recall => "recall",
            MetricKind::Iou => "iou",
            MetricKind::Accuracy => "accuracy",
        }
    }
}

/// Transform applied to raw logits before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricActivation {
    #[default]
    Argmax2d,
    Sigmoid,
    Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub kind: MetricKind,
    #[serde(default)]
    pub activation: MetricActivation,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
}

impl MetricConfig {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            activation: MetricActivation::Argmax2d,
            threshold: default_threshold(),
            beta: default_beta(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub momentum: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            momentum: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    #[serde(alias = "adamw")]
    AdamW,
    Sgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_milestones")]
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_epochs: default_warmup_epochs(),
            multiplier: default_multiplier(),
            milestones: default_milestones(),
            gamma: default_gamma(),
        }
    }
}

impl SchedulerConfig {
    pub fn schedule(&self) -> Schedule {
        let step = || Schedule::Step {
            milestones: self.milestones.clone(),
            gamma: self.gamma,
        };
        match self.strategy {
            LearningRateSchedule::Constant => Schedule::Constant,
            LearningRateSchedule::Step => step(),
            LearningRateSchedule::WarmupConstant => Schedule::Warmup {
                length: self.warmup_epochs,
                multiplier: self.multiplier,
                inner: Box::new(Schedule::Constant),
            },
            LearningRateSchedule::WarmupStep => Schedule::Warmup {
                length: self.warmup_epochs,
                multiplier: self.multiplier,
                inner: Box::new(step()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    Step,
    WarmupConstant,
    #[default]
    WarmupStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub visualization: VisualizationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            device: DeviceKind::default(),
            verbose: true,
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
            visualization: VisualizationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
        absolutize_in_place(&mut self.visualization.save_dir, base);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_name")]
    pub filename: String,
    /// Validation metric whose improvement triggers a save.
    #[serde(default = "default_checkpoint_metric")]
    pub metric: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            filename: default_checkpoint_name(),
            metric: default_checkpoint_metric(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default)]
    pub weights: VisualizationWeights,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_dir: default_save_dir(),
            window_size: default_window_size(),
            image_size: default_image_size(),
            weights: VisualizationWeights::default(),
        }
    }
}

/// Which parameters the final inference pass runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationWeights {
    /// Reload the best snapshot when one was saved.
    #[default]
    Best,
    /// Use the in-memory parameters after the last epoch.
    Final,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_encoder_name() -> String {
    "unet".to_string()
}

fn default_in_channels() -> usize {
    3
}

fn default_classes() -> usize {
    2
}

fn default_fusion_form() -> String {
    "concat".to_string()
}

fn default_train_split() -> SplitConfig {
    let mut split = SplitConfig::new("../LEVIR-CD/train");
    split.ann_dir = Some(PathBuf::from("../LEVIR-CD/train/label"));
    split
}

fn default_valid_split() -> SplitConfig {
    let mut split = SplitConfig::new("../LEVIR-CD/test");
    split.ann_dir = Some(PathBuf::from("../LEVIR-CD/test/label"));
    split.test_mode = true;
    split
}

fn default_sub_dir_1() -> String {
    "A".to_string()
}

fn default_sub_dir_2() -> String {
    "B".to_string()
}

fn default_img_suffix() -> String {
    ".png".to_string()
}

fn default_debug_samples() -> usize {
    change_data::dataset::DEFAULT_DEBUG_SAMPLES
}

fn default_train_batch_size() -> usize {
    8
}

fn default_valid_batch_size() -> usize {
    1
}

fn default_mean() -> Vec<f32> {
    Normalization::imagenet().mean
}

fn default_std() -> Vec<f32> {
    Normalization::imagenet().std
}

fn default_metrics() -> Vec<MetricConfig> {
    vec![
        MetricConfig::new(MetricKind::Fscore),
        MetricConfig::new(MetricKind::Precision),
        MetricConfig::new(MetricKind::Recall),
    ]
}

fn default_threshold() -> f64 {
    0.5
}

fn default_beta() -> f64 {
    1.0
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_warmup_epochs() -> usize {
    5
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_milestones() -> Vec<usize> {
    vec![30, 50]
}

fn default_gamma() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    60
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_checkpoint_name() -> String {
    "best_model".to_string()
}

fn default_checkpoint_metric() -> String {
    MetricKind::Fscore.name().to_string()
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("./res")
}

fn default_window_size() -> usize {
    256
}

fn default_image_size() -> usize {
    1024
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Data(DatasetError),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Data(err) => write!(f, "data error: {}", err),
            TrainingError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Data(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<DatasetError> for TrainingError {
    fn from(value: DatasetError) -> Self {
        TrainingError::Data(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_levir_recipe() {
        let config = TrainingConfig::default();
        assert_eq!(config.runtime.epochs, 60);
        assert_eq!(config.data.train_batch_size, 8);
        assert_eq!(config.data.valid_batch_size, 1);
        assert!(config.data.valid.test_mode);
        assert!(!config.data.train.test_mode);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.scheduler.milestones, vec![30, 50]);
        assert_eq!(config.scheduler.warmup_epochs, 5);
        assert_eq!(config.runtime.checkpoint.metric, "fscore");
        let names: Vec<&str> = config.metrics.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["fscore", "precision", "recall"]);
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.data.train_batch_size = 0;
        config.optimizer.learning_rate = 0.0;
        config.runtime.checkpoint.metric = "loss".into();
        config.scheduler.milestones = vec![50, 30];

        let Err(TrainingError::Validation(messages)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(messages.len(), 4, "{messages:?}");
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(
            &path,
            r#"
metrics = [{ kind = "fscore" }, { kind = "iou", activation = "argmax2d" }]

[data.train]
root = "levir/train"

[data.valid]
root = "levir/test"
test_mode = true

[scheduler]
strategy = "warmup_constant"
warmup_epochs = 2

[runtime]
epochs = 3
checkpoint = { directory = "ckpt", metric = "iou" }
"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.train.root, tmp.path().join("levir/train"));
        assert_eq!(config.runtime.checkpoint.directory, tmp.path().join("ckpt"));
        assert_eq!(config.runtime.visualization.save_dir, tmp.path().join("./res"));
        assert_eq!(config.metrics.len(), 2);
        assert_eq!(config.runtime.epochs, 3);
        assert!(matches!(
            config.scheduler.schedule(),
            Schedule::Warmup { length: 2, .. }
        ));
    }

    #[test]
    fn optimizer_algorithm_accepts_adamw_spellings() {
        for spelling in ["adamw", "adam_w"] {
            let config: TrainingConfig =
                toml::from_str(&format!("[optimizer]\nalgorithm = \"{spelling}\"\n")).unwrap();
            assert!(matches!(config.optimizer.algorithm, OptimizerType::AdamW), "{spelling}");
        }
    }

    #[test]
    fn runtime_errors_do_not_repeat_the_cli_prefix() {
        let message = TrainingError::runtime("disk full").to_string();
        assert_eq!(message, "runtime error: disk full");
    }
}
