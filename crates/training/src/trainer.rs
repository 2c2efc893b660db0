use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use change_data::ChangeDetectionDataset;
use model::{build_model, ChangeDetector};

use crate::{
    checkpoint::BestCheckpoint,
    config::{DeviceKind, VisualizationWeights},
    data::{BlockingDataLoader, ChangeDetectionLoader, DataLoader},
    epoch::{EpochLog, EpochRunner, RunMode},
    logging::{EpochRecord, Logger, LoggingSettings},
    loss::CrossEntropyLoss,
    metrics::build_metrics,
    optimizer::{OptimizerConfig, TrainerOptimizer},
    scheduler::{EpochScheduler, LRScheduler},
    visualize::{visualize, VisualizationSettings},
    TrainingConfig, TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Running { epoch: usize },
    Finished,
}

/// Inference pass run once training has finished.
#[derive(Debug, Clone)]
pub struct VisualizationPlan {
    pub settings: VisualizationSettings,
    pub weights: VisualizationWeights,
}

/// Pre-built collaborators for [`Trainer::from_parts`].
pub struct TrainerParts {
    pub model: Box<dyn ChangeDetector>,
    pub train_loader: Box<dyn DataLoader>,
    pub valid_loader: Box<dyn DataLoader>,
    pub train_runner: EpochRunner,
    pub valid_runner: EpochRunner,
    pub optimizer: TrainerOptimizer,
    pub scheduler: Box<dyn LRScheduler>,
    pub checkpoint: BestCheckpoint,
    pub logger: Logger,
    pub epochs: usize,
    pub visualization: Option<VisualizationPlan>,
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: EpochLog,
    pub valid: EpochLog,
    pub improved: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub best_score: f64,
    pub best_epoch: Option<usize>,
    pub saves: usize,
    /// Change maps written by the final pass, `None` when it did not run.
    pub visualized: Option<usize>,
    pub interrupted: bool,
}

/// Drives the epoch loop: schedule, train, validate, keep the best snapshot.
pub struct Trainer {
    model: Box<dyn ChangeDetector>,
    train_loader: BlockingDataLoader<Box<dyn DataLoader>>,
    valid_loader: BlockingDataLoader<Box<dyn DataLoader>>,
    train_runner: EpochRunner,
    valid_runner: EpochRunner,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    checkpoint: BestCheckpoint,
    logger: Logger,
    epochs: usize,
    visualization: Option<VisualizationPlan>,
    state: TrainerState,
}

impl Trainer {
    pub fn from_config(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device(config.runtime.device)?;
        if !seed_device(&device, config.runtime.seed) {
            println!(
                "[training] cpu weight init is not seedable; seed {} applies to data shuffling only",
                config.runtime.seed
            );
        }

        let spec = config.model.to_spec()?;
        let model = build_model(&spec, &device).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;
        println!(
            "[training] model ready (encoder={} fusion={} siam_encoder={} classes={})",
            spec.encoder_name, spec.fusion_form, spec.siam_encoder, spec.classes
        );

        let normalization = config.data.normalization();
        let train_set = ChangeDetectionDataset::open(
            config.data.train.to_dataset_config(),
            normalization.clone(),
        )?;
        let valid_set =
            ChangeDetectionDataset::open(config.data.valid.to_dataset_config(), normalization)?;
        let train_loader = ChangeDetectionLoader::new(
            train_set,
            config.data.train_batch_size,
            config.data.drop_last,
            config.runtime.seed,
            device.clone(),
        )?;
        let valid_loader = ChangeDetectionLoader::new(
            valid_set,
            config.data.valid_batch_size,
            false,
            config.runtime.seed,
            device.clone(),
        )?;
        println!(
            "[training] data ready (train_batch_size={} valid_batch_size={})",
            config.data.train_batch_size, config.data.valid_batch_size
        );

        let loss = CrossEntropyLoss::new().with_ignore_index(config.loss.ignore_index);
        let train_runner =
            EpochRunner::new(RunMode::Train, loss.clone(), build_metrics(&config.metrics))
                .with_verbose(config.runtime.verbose);
        let valid_runner = EpochRunner::new(RunMode::Eval, loss, build_metrics(&config.metrics))
            .with_verbose(config.runtime.verbose);

        let named_parameters = model.parameters();
        println!(
            "[training] optimizer will track {} tensor(s)",
            named_parameters.len()
        );
        let optimizer =
            TrainerOptimizer::new(named_parameters, OptimizerConfig::from(&config.optimizer))?;
        let scheduler =
            EpochScheduler::from_config(&config.scheduler, config.optimizer.learning_rate)?;

        let checkpoint = BestCheckpoint::new(
            config.runtime.checkpoint.directory.clone(),
            config.runtime.checkpoint.metric.clone(),
        )
        .with_name(config.runtime.checkpoint.filename.clone());
        let logger = Logger::new(LoggingSettings::from(&config.runtime.logging))?;

        let vis = &config.runtime.visualization;
        let visualization = vis.enabled.then(|| VisualizationPlan {
            settings: VisualizationSettings::from(vis),
            weights: vis.weights,
        });

        Self::from_parts(TrainerParts {
            model: Box::new(model),
            train_loader: Box::new(train_loader),
            valid_loader: Box::new(valid_loader),
            train_runner,
            valid_runner,
            optimizer,
            scheduler: Box::new(scheduler),
            checkpoint,
            logger,
            epochs: config.runtime.epochs,
            visualization,
        })
    }

    pub fn from_parts(parts: TrainerParts) -> Result<Self, TrainingError> {
        if parts.epochs == 0 {
            return Err(TrainingError::initialization(
                "trainer requires at least one epoch",
            ));
        }
        if parts.train_runner.mode() != RunMode::Train || parts.valid_runner.mode() != RunMode::Eval
        {
            return Err(TrainingError::initialization(
                "trainer expects a train-mode and an eval-mode epoch runner",
            ));
        }
        let monitored = parts.checkpoint.metric();
        if !parts.valid_runner.metric_names().any(|name| name == monitored) {
            return Err(TrainingError::initialization(format!(
                "validation runner does not compute the monitored metric '{monitored}'"
            )));
        }

        Ok(Self {
            model: parts.model,
            train_loader: BlockingDataLoader::new(parts.train_loader),
            valid_loader: BlockingDataLoader::new(parts.valid_loader),
            train_runner: parts.train_runner,
            valid_runner: parts.valid_runner,
            optimizer: parts.optimizer,
            scheduler: parts.scheduler,
            checkpoint: parts.checkpoint,
            logger: parts.logger,
            epochs: parts.epochs,
            visualization: parts.visualization,
            state: TrainerState::Idle,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &dyn ChangeDetector {
        self.model.as_ref()
    }

    pub fn checkpoint(&self) -> &BestCheckpoint {
        &self.checkpoint
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn fit(&mut self) -> Result<TrainingReport, TrainingError> {
        self.fit_with_shutdown(|| false)
    }

    /// Runs every epoch, polling `should_stop` before each one.
    pub fn fit_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingReport, TrainingError>
    where
        F: FnMut() -> bool,
    {
        if self.state != TrainerState::Idle {
            return Err(TrainingError::runtime("trainer has already been run"));
        }

        let monitored = self.checkpoint.metric().to_string();
        let mut summaries = Vec::with_capacity(self.epochs);
        let mut interrupted = false;

        println!(
            "[training] starting {} epoch(s), monitoring valid {}",
            self.epochs, monitored
        );

        for epoch in 1..=self.epochs {
            if should_stop() {
                println!("[training] stop requested before epoch {epoch}");
                interrupted = true;
                break;
            }
            self.state = TrainerState::Running { epoch };

            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);

            let train = self.train_runner.run(
                self.model.as_ref(),
                &mut self.train_loader,
                Some(&mut self.optimizer),
                epoch,
            )?;
            let valid =
                self.valid_runner
                    .run(self.model.as_ref(), &mut self.valid_loader, None, epoch)?;

            let score = valid.get(&monitored).ok_or_else(|| {
                TrainingError::runtime(format!("validation log is missing '{monitored}'"))
            })?;
            let improved = self.checkpoint.consider(score, self.model.as_ref(), epoch)?;

            self.logger.log_epoch(&EpochRecord {
                epoch,
                total_epochs: self.epochs,
                learning_rate: lr,
                train: &train,
                valid: &valid,
                monitored: &monitored,
                best_score: self.checkpoint.best_score(),
                improved,
            });

            summaries.push(EpochSummary {
                epoch,
                learning_rate: lr,
                train,
                valid,
                improved,
            });
        }

        self.state = TrainerState::Finished;
        self.logger.flush();

        let visualized = if interrupted {
            None
        } else {
            self.run_visualization()?
        };

        Ok(TrainingReport {
            epochs: summaries,
            best_score: self.checkpoint.best_score(),
            best_epoch: self.checkpoint.best_epoch(),
            saves: self.checkpoint.saves(),
            visualized,
            interrupted,
        })
    }

    fn run_visualization(&mut self) -> Result<Option<usize>, TrainingError> {
        let Some(plan) = self.visualization.as_ref() else {
            return Ok(None);
        };

        if plan.weights == VisualizationWeights::Best {
            if self.checkpoint.load_best_weights(self.model.as_ref())? {
                println!(
                    "[training] visualizing with best weights from epoch {}",
                    self.checkpoint.best_epoch().unwrap_or_default()
                );
            } else {
                println!("[training] no snapshot saved; visualizing with final weights");
            }
        }

        visualize(self.model.as_ref(), &mut self.valid_loader, &plan.settings).map(Some)
    }
}

/// Seeds the device RNG used for weight init. candle's CPU backend draws from
/// the thread RNG and cannot be seeded, so this returns `false` there.
fn seed_device(device: &Device, seed: u64) -> bool {
    if device.is_cpu() {
        return false;
    }
    match device.set_seed(seed) {
        Ok(()) => true,
        Err(err) => {
            eprintln!("warning: failed to seed device RNG: {}", err);
            false
        }
    }
}

fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize cuda device: {err}"))
        })?,
        DeviceKind::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize metal device: {err}"))
        })?,
        DeviceKind::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            println!(
                "device detection: cuda_available={} metal_available={}",
                cuda_available, metal_available
            );
            if cuda_available {
                Device::cuda_if_available(0).unwrap_or_else(|err| {
                    eprintln!("cuda reported available but initialization failed: {err}");
                    Device::Cpu
                })
            } else if metal_available {
                Device::new_metal(0).unwrap_or_else(|err| {
                    eprintln!("failed to initialize metal device, falling back to CPU: {err}");
                    Device::Cpu
                })
            } else {
                eprintln!("no GPU backend available; using CPU");
                Device::Cpu
            }
        }
    };

    println!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_seeding_is_skipped_without_error() {
        assert!(!seed_device(&Device::Cpu, 42));
        let device = select_device(DeviceKind::Cpu).unwrap();
        assert!(device.is_cpu());
    }
}
