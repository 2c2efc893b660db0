use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Pixel-wise cross entropy over `(B, C, H, W)` logits and `(B, H, W)` class targets.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes, height, width) = logits.dims4().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (B, C, H, W) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if classes < 2 {
            return Err(TrainingError::runtime(
                "cross entropy needs at least two classes",
            ));
        }
        if targets.dims() != [batch, height, width] {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits {:?}",
                targets.dims(),
                logits.dims()
            )));
        }

        let pixels = batch * height * width;
        if pixels == 0 {
            return Err(TrainingError::runtime("no pixels available for loss"));
        }

        let device = logits.device();
        let logits_flat = logits
            .permute((0, 2, 3, 1))
            .map_err(to_runtime_error)?
            .reshape((pixels, classes))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((pixels,))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::U8 | DType::I64 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let (valid_mask, gather_targets) = match self.ignore_index {
            Some(ignore_index) => {
                let mask = targets_flat.ne(ignore_index).map_err(to_runtime_error)?;
                // Ignored pixels gather class 0 and are masked out afterwards.
                let zeros = targets_flat.zeros_like().map_err(to_runtime_error)?;
                let safe = mask
                    .where_cond(&targets_flat, &zeros)
                    .map_err(to_runtime_error)?;
                (mask.to_dtype(DType::F32).map_err(to_runtime_error)?, safe)
            }
            None => (
                Tensor::ones((pixels,), DType::F32, device).map_err(to_runtime_error)?,
                targets_flat,
            ),
        };

        let valid = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;
        if valid == 0 {
            return Err(TrainingError::runtime(
                "no valid pixels remain after applying ignore_index",
            ));
        }

        let nll = log_probs
            .gather(&gather_targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;
        let loss = (&nll * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .affine(1f64 / valid as f64, 0.0)
            .map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            value: value as f64,
            pixels: valid,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss tensor, differentiable with respect to the logits.
    pub loss: Tensor,
    pub value: f64,
    pub pixels: usize,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_class_count() {
        let logits = Tensor::zeros((2, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::ones((2, 3, 3), DType::U32, &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert!((out.value - std::f64::consts::LN_2).abs() < 1e-6);
        assert_eq!(out.pixels, 18);
    }

    #[test]
    fn confident_correct_logits_have_small_loss() {
        // Class 1 wins by a wide margin at each of the four pixels.
        let mut data = vec![0f32; 4];
        data.extend(vec![20f32; 4]);
        let logits = Tensor::from_vec(data, (1, 2, 2, 2), &Device::Cpu).unwrap();
        let targets = Tensor::ones((1, 2, 2), DType::U32, &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert!(out.value < 1e-6, "{}", out.value);
    }

    #[test]
    fn ignored_pixels_do_not_count() {
        let logits = Tensor::zeros((1, 2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[[1u32, 255]]], &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new()
            .with_ignore_index(Some(255))
            .compute(&logits, &targets)
            .unwrap();
        assert_eq!(out.pixels, 1);
        assert!((out.value - std::f64::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_targets() {
        let logits = Tensor::zeros((1, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 2, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
    }
}
