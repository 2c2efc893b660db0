use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances to the next epoch and returns its learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Number of completed `step` calls.
    fn epoch(&self) -> usize;
}

/// Epoch-indexed learning-rate schedule.
///
/// Epochs are 1-based: `rate_at(1, lr)` is the rate used for the first epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Constant,
    /// Multiplies the rate by `gamma` at each epoch listed in `milestones`.
    Step { milestones: Vec<usize>, gamma: f64 },
    /// Ramps from ~0 to `base * multiplier` over `length` epochs, then hands off to `inner`.
    Warmup {
        length: usize,
        multiplier: f64,
        inner: Box<Schedule>,
    },
}

impl Schedule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Schedule::Constant => Ok(()),
            Schedule::Step { milestones, gamma } => {
                if milestones.is_empty() {
                    return Err("step schedule requires at least one milestone".into());
                }
                if milestones.contains(&0) {
                    return Err("milestones are 1-based epochs and cannot be 0".into());
                }
                if milestones.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(format!(
                        "milestones must be strictly increasing (got {:?})",
                        milestones
                    ));
                }
                if !(*gamma > 0.0 && *gamma <= 1.0) {
                    return Err(format!("gamma must be in (0, 1] (got {gamma})"));
                }
                Ok(())
            }
            Schedule::Warmup {
                length,
                multiplier,
                inner,
            } => {
                if *length == 0 {
                    return Err("warmup length must be greater than 0".into());
                }
                if !(*multiplier >= 1.0) {
                    return Err(format!("warmup multiplier must be >= 1 (got {multiplier})"));
                }
                match inner.as_ref() {
                    Schedule::Warmup { .. } => Err("warmup cannot wrap another warmup".into()),
                    Schedule::Step { milestones, .. } => {
                        if let Some(first) = milestones.first() {
                            if *first <= *length {
                                return Err(format!(
                                    "first milestone {first} falls inside the {length} epoch warmup"
                                ));
                            }
                        }
                        inner.validate()
                    }
                    Schedule::Constant => Ok(()),
                }
            }
        }
    }

    pub fn rate_at(&self, epoch: usize, base_lr: f64) -> f64 {
        match self {
            Schedule::Constant => base_lr,
            Schedule::Step { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| epoch >= m).count();
                base_lr * gamma.powi(passed as i32)
            }
            Schedule::Warmup {
                length,
                multiplier,
                inner,
            } => {
                if epoch > *length {
                    return inner.rate_at(epoch, base_lr * multiplier);
                }
                let progress = epoch as f64 / *length as f64;
                if *multiplier == 1.0 {
                    base_lr * progress
                } else {
                    base_lr * ((multiplier - 1.0) * progress + 1.0)
                }
            }
        }
    }
}

/// Stateful driver that hands one learning rate per epoch to the trainer.
#[derive(Debug, Clone)]
pub struct EpochScheduler {
    schedule: Schedule,
    base_lr: f64,
    epoch: usize,
    current_lr: f64,
}

impl EpochScheduler {
    pub fn new(schedule: Schedule, base_lr: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        schedule.validate().map_err(TrainingError::initialization)?;
        Ok(Self {
            schedule,
            base_lr,
            epoch: 0,
            current_lr: base_lr,
        })
    }

    pub fn from_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        Self::new(cfg.schedule(), base_lr)
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

impl LRScheduler for EpochScheduler {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.current_lr = self.schedule.rate_at(self.epoch, self.base_lr);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * b.abs().max(1.0)
    }

    fn levir_schedule() -> Schedule {
        Schedule::Warmup {
            length: 5,
            multiplier: 1.0,
            inner: Box::new(Schedule::Step {
                milestones: vec![30, 50],
                gamma: 0.1,
            }),
        }
    }

    #[test]
    fn warmup_then_step_decay() {
        let mut scheduler = EpochScheduler::new(levir_schedule(), 1e-4).unwrap();
        let rates: Vec<f64> = (0..60).map(|_| scheduler.step()).collect();

        assert!(close(rates[0], 2e-5));
        assert!(close(rates[4], 1e-4));
        assert!(close(rates[5], 1e-4));
        assert!(close(rates[28], 1e-4));
        assert!(close(rates[29], 1e-5));
        assert!(close(rates[49], 1e-6));
        assert!(close(rates[59], 1e-6));
        assert_eq!(scheduler.epoch(), 60);
        assert!(rates[..5].windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn warmup_multiplier_scales_target() {
        let schedule = Schedule::Warmup {
            length: 4,
            multiplier: 3.0,
            inner: Box::new(Schedule::Constant),
        };
        assert!(close(schedule.rate_at(2, 1.0), 2.0));
        assert!(close(schedule.rate_at(4, 1.0), 3.0));
        assert!(close(schedule.rate_at(9, 1.0), 3.0));
    }

    #[test]
    fn constant_schedule_keeps_base_rate() {
        let mut scheduler = EpochScheduler::new(Schedule::Constant, 0.5).unwrap();
        assert!(close(scheduler.learning_rate(), 0.5));
        for _ in 0..3 {
            assert!(close(scheduler.step(), 0.5));
        }
    }

    #[test]
    fn rejects_malformed_schedules() {
        let bad = [
            Schedule::Step {
                milestones: vec![],
                gamma: 0.1,
            },
            Schedule::Step {
                milestones: vec![10, 10],
                gamma: 0.1,
            },
            Schedule::Step {
                milestones: vec![10],
                gamma: 1.5,
            },
            Schedule::Warmup {
                length: 0,
                multiplier: 1.0,
                inner: Box::new(Schedule::Constant),
            },
            Schedule::Warmup {
                length: 5,
                multiplier: 0.5,
                inner: Box::new(Schedule::Constant),
            },
            Schedule::Warmup {
                length: 5,
                multiplier: 1.0,
                inner: Box::new(Schedule::Step {
                    milestones: vec![3, 30],
                    gamma: 0.1,
                }),
            },
        ];
        for schedule in bad {
            assert!(
                EpochScheduler::new(schedule.clone(), 1e-3).is_err(),
                "{schedule:?} should be rejected"
            );
        }
        assert!(EpochScheduler::new(Schedule::Constant, 0.0).is_err());
    }
}
