use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    /// Adam with L2 weight decay folded into the gradient.
    Adam(AdamConfig),
    /// Adam with decoupled weight decay.
    AdamW(AdamConfig),
    Sgd(SgdConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let adam = AdamConfig {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        };
        match value.algorithm {
            config::OptimizerType::Adam => OptimizerConfig::Adam(adam),
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(adam),
            config::OptimizerType::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.learning_rate,
                momentum: value.momentum,
                weight_decay: value.weight_decay,
            }),
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters but '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update from the gradients in `grads`. Parameters without
    /// a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                processed.push((idx, grad));
            }
        }
        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, false, processed),
            OptimizerConfig::AdamW(cfg) => self.step_adam(cfg, true, processed),
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed),
        }
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        decoupled: bool,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let current = slot.param.as_tensor().clone();

            let grad = if !decoupled && cfg.weight_decay != 0.0 {
                let decay = current.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = if decoupled && cfg.weight_decay != 0.0 {
                current
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                current
            };
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let current = slot.param.as_tensor().clone();

            let grad = if cfg.weight_decay != 0.0 {
                let decay = current.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let direction = if cfg.momentum > 0.0 {
                // Velocity lives in the first-moment slot.
                let velocity = if self.step == 1 {
                    grad
                } else {
                    slot.first_moment
                        .affine(cfg.momentum, 0.0)
                        .map_err(to_runtime_error)?
                        .add(&grad)
                        .map_err(to_runtime_error)?
                };
                slot.first_moment = velocity.clone();
                velocity
            } else {
                grad
            };

            let next = current
                .sub(&direction.affine(cfg.learning_rate, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_step(config: OptimizerConfig) -> f32 {
        let var = Var::from_tensor(&Tensor::new(&[2f32], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = TrainerOptimizer::new(vec![("w".into(), var.clone())], config).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn adam_moves_against_gradient_by_learning_rate() {
        let updated = quadratic_step(OptimizerConfig::Adam(AdamConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }));
        // First bias-corrected Adam step has magnitude ~lr.
        assert!((updated - 1.9).abs() < 1e-4, "{updated}");
    }

    #[test]
    fn sgd_applies_plain_gradient_step() {
        let updated = quadratic_step(OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.25,
            momentum: 0.9,
            weight_decay: 0.0,
        }));
        // d/dw w^2 = 4 at w = 2.
        assert!((updated - 1.0).abs() < 1e-6, "{updated}");
    }

    #[test]
    fn learning_rate_can_be_replaced_between_epochs() {
        let var = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), var)],
            OptimizerConfig::from(&config::OptimizerConfig::default()),
        )
        .unwrap();
        assert_eq!(optimizer.learning_rate(), 1e-4);
        optimizer.set_learning_rate(2e-5);
        assert_eq!(optimizer.learning_rate(), 2e-5);
        assert_eq!(optimizer.parameter_names().collect::<Vec<_>>(), vec!["w"]);
    }

    #[test]
    fn rejects_empty_parameter_list() {
        let err = TrainerOptimizer::new(
            Vec::new(),
            OptimizerConfig::from(&config::OptimizerConfig::default()),
        )
        .unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }
}
