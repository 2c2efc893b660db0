use candle_core::{DType, Device, Tensor};
use candle_nn::ops;

use crate::{
    config::{MetricActivation, MetricConfig, MetricKind},
    TrainingError,
};

const SMOOTH: f64 = 1e-7;

/// Batch-size weighted running mean of a per-batch value.
#[derive(Debug, Clone, Default)]
pub struct EpochMeter {
    sum: f64,
    count: usize,
}

impl EpochMeter {
    pub fn update(&mut self, value: f64, batch_size: usize) {
        self.sum += value * batch_size as f64;
        self.count += batch_size;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Scalar score of a batch of predictions against its labels.
pub trait Metric {
    fn name(&self) -> &str;
    fn compute(&self, logits: &Tensor, target: &Tensor) -> Result<f64, TrainingError>;
}

/// Pixel-level confusion counts of the "changed" class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfusionCounts {
    pub true_positive: f64,
    pub false_positive: f64,
    pub false_negative: f64,
    pub true_negative: f64,
}

impl ConfusionCounts {
    pub fn total(&self) -> f64 {
        self.true_positive + self.false_positive + self.false_negative + self.true_negative
    }
}

/// Precision/recall family of metrics over binarised predictions.
///
/// With `argmax2d` a pixel is predicted changed when its arg-max class is
/// non-zero. `sigmoid` and `identity` read the last channel and compare it
/// against `threshold`. Label pixels are changed when non-zero.
#[derive(Debug, Clone)]
pub struct ConfusionMetric {
    kind: MetricKind,
    activation: MetricActivation,
    threshold: f64,
    beta: f64,
}

impl ConfusionMetric {
    pub fn new(kind: MetricKind) -> Self {
        Self::from_config(&MetricConfig::new(kind))
    }

    pub fn from_config(config: &MetricConfig) -> Self {
        Self {
            kind: config.kind,
            activation: config.activation,
            threshold: config.threshold,
            beta: config.beta,
        }
    }

    pub fn counts(&self, logits: &Tensor, target: &Tensor) -> Result<ConfusionCounts, TrainingError> {
        let (batch, channels, height, width) = logits.dims4().map_err(|_| {
            TrainingError::runtime(format!(
                "metrics expect (B, C, H, W) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if target.dims() != [batch, height, width] {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits {:?}",
                target.dims(),
                logits.dims()
            )));
        }

        let predicted = match self.activation {
            MetricActivation::Argmax2d => logits
                .argmax(1)
                .map_err(to_runtime_error)?
                .ne(0u32)
                .map_err(to_runtime_error)?,
            MetricActivation::Sigmoid | MetricActivation::Identity => {
                let channel = logits
                    .narrow(1, channels - 1, 1)
                    .map_err(to_runtime_error)?
                    .squeeze(1)
                    .map_err(to_runtime_error)?;
                let activated = if matches!(self.activation, MetricActivation::Sigmoid) {
                    ops::sigmoid(&channel).map_err(to_runtime_error)?
                } else {
                    channel
                };
                activated.gt(self.threshold).map_err(to_runtime_error)?
            }
        };
        let actual = target
            .to_device(logits.device())
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?
            .ne(0u32)
            .map_err(to_runtime_error)?;
        // Counts are accumulated in f64 on the host.
        let to_host = |mask: &Tensor| -> Result<Tensor, TrainingError> {
            mask.to_device(&Device::Cpu)
                .map_err(to_runtime_error)?
                .to_dtype(DType::F64)
                .map_err(to_runtime_error)
        };
        let predicted = to_host(&predicted)?;
        let actual = to_host(&actual)?;

        let sum = |t: &Tensor| -> Result<f64, TrainingError> {
            t.sum_all()
                .map_err(to_runtime_error)?
                .to_vec0::<f64>()
                .map_err(to_runtime_error)
        };
        let tp = sum(&(&predicted * &actual).map_err(to_runtime_error)?)?;
        let predicted_pos = sum(&predicted)?;
        let actual_pos = sum(&actual)?;
        let total = (batch * height * width) as f64;

        let false_positive = predicted_pos - tp;
        let false_negative = actual_pos - tp;
        Ok(ConfusionCounts {
            true_positive: tp,
            false_positive,
            false_negative,
            true_negative: total - tp - false_positive - false_negative,
        })
    }

    pub fn score(&self, counts: &ConfusionCounts) -> f64 {
        let ConfusionCounts {
            true_positive: tp,
            false_positive: fp,
            false_negative: fn_,
            true_negative: tn,
        } = *counts;
        match self.kind {
            MetricKind::Fscore => {
                let b2 = self.beta * self.beta;
                ((1.0 + b2) * tp + SMOOTH) / ((1.0 + b2) * tp + b2 * fn_ + fp + SMOOTH)
            }
            MetricKind::Precision => (tp + SMOOTH) / (tp + fp + SMOOTH),
            MetricKind::Recall => (tp + SMOOTH) / (tp + fn_ + SMOOTH),
            MetricKind::Iou => (tp + SMOOTH) / (tp + fp + fn_ + SMOOTH),
            MetricKind::Accuracy => {
                let total = counts.total();
                if total == 0.0 {
                    0.0
                } else {
                    (tp + tn) / total
                }
            }
        }
    }
}

impl Metric for ConfusionMetric {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn compute(&self, logits: &Tensor, target: &Tensor) -> Result<f64, TrainingError> {
        let counts = self.counts(logits, target)?;
        Ok(self.score(&counts))
    }
}

pub fn build_metrics(configs: &[MetricConfig]) -> Vec<Box<dyn Metric>> {
    configs
        .iter()
        .map(|cfg| Box::new(ConfusionMetric::from_config(cfg)) as Box<dyn Metric>)
        .collect()
}

/// Class index with the highest logit per pixel, `(B, C, H, W)` to `(B, H, W)`.
pub fn argmax_classes(logits: &Tensor) -> Result<Tensor, TrainingError> {
    if logits.rank() != 4 {
        return Err(TrainingError::runtime(format!(
            "expected (B, C, H, W) logits, got {:?}",
            logits.dims()
        )));
    }
    logits.argmax(1).map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
