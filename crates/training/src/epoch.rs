use std::fmt;

use indicatif::{ProgressBar, ProgressStyle};
use model::ChangeDetector;

use crate::{
    data::{BlockingDataLoader, DataLoader},
    loss::CrossEntropyLoss,
    metrics::{EpochMeter, Metric},
    optimizer::TrainerOptimizer,
    TrainingError,
};

pub const LOSS_KEY: &str = "loss";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Forward, backward and one optimizer step per batch.
    Train,
    /// Forward only; parameters are never written.
    Eval,
}

impl RunMode {
    pub fn stage(self) -> &'static str {
        match self {
            RunMode::Train => "train",
            RunMode::Eval => "valid",
        }
    }
}

/// Epoch means keyed by metric name, loss first then metrics in configured order.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochLog {
    entries: Vec<(String, f64)>,
    samples: usize,
    batches: usize,
}

impl EpochLog {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn loss(&self) -> f64 {
        self.get(LOSS_KEY).unwrap_or(f64::NAN)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}

impl fmt::Display for EpochLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{key}={value:.4}")?;
            first = false;
        }
        Ok(())
    }
}

/// Runs one pass over a loader in either training or evaluation mode.
pub struct EpochRunner {
    mode: RunMode,
    loss: CrossEntropyLoss,
    metrics: Vec<Box<dyn Metric>>,
    verbose: bool,
}

impl EpochRunner {
    pub fn new(mode: RunMode, loss: CrossEntropyLoss, metrics: Vec<Box<dyn Metric>>) -> Self {
        Self {
            mode,
            loss,
            metrics,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|metric| metric.name())
    }

    pub fn run<M, L>(
        &self,
        model: &M,
        loader: &mut BlockingDataLoader<L>,
        optimizer: Option<&mut TrainerOptimizer>,
        epoch: usize,
    ) -> Result<EpochLog, TrainingError>
    where
        M: ChangeDetector + ?Sized,
        L: DataLoader,
    {
        let mut optimizer = match (self.mode, optimizer) {
            (RunMode::Train, None) => {
                return Err(TrainingError::runtime(
                    "training epoch requires an optimizer",
                ));
            }
            (RunMode::Train, Some(optimizer)) => Some(optimizer),
            (RunMode::Eval, _) => None,
        };

        let was_training = model.is_training();
        model.set_training(self.mode == RunMode::Train);
        let outcome = self.run_batches(model, loader, optimizer.as_deref_mut(), epoch);
        model.set_training(was_training);
        outcome
    }

    fn run_batches<M, L>(
        &self,
        model: &M,
        loader: &mut BlockingDataLoader<L>,
        mut optimizer: Option<&mut TrainerOptimizer>,
        epoch: usize,
    ) -> Result<EpochLog, TrainingError>
    where
        M: ChangeDetector + ?Sized,
        L: DataLoader,
    {
        loader.start_epoch(epoch)?;
        let progress = self.progress_bar(loader.batches_per_epoch(), epoch);

        let mut loss_meter = EpochMeter::default();
        let mut metric_meters = vec![EpochMeter::default(); self.metrics.len()];
        let mut batches = 0usize;

        while let Some(batch) = loader.next_batch()? {
            let batch_size = batch.batch_size();
            let logits = model
                .forward(&batch.pre, &batch.post)
                .map_err(to_runtime_error)?;
            let loss = self.loss.compute(&logits, &batch.label)?;

            if let Some(optimizer) = optimizer.as_deref_mut() {
                let mut grads = loss.loss.backward().map_err(to_runtime_error)?;
                optimizer.step(&mut grads)?;
                optimizer.zero_grad(&mut grads);
            }

            let logits = logits.detach();
            loss_meter.update(loss.value, batch_size);
            for (metric, meter) in self.metrics.iter().zip(metric_meters.iter_mut()) {
                meter.update(metric.compute(&logits, &batch.label)?, batch_size);
            }
            batches += 1;

            if let Some(pb) = progress.as_ref() {
                pb.set_message(format!("{LOSS_KEY}={:.4}", loss_meter.mean().unwrap_or(0.0)));
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        let Some(loss) = loss_meter.mean() else {
            return Err(TrainingError::runtime(format!(
                "{} epoch {} produced no batches",
                self.mode.stage(),
                epoch
            )));
        };

        let mut entries = Vec::with_capacity(self.metrics.len() + 1);
        entries.push((LOSS_KEY.to_string(), loss));
        for (metric, meter) in self.metrics.iter().zip(metric_meters.iter()) {
            entries.push((metric.name().to_string(), meter.mean().unwrap_or(0.0)));
        }

        Ok(EpochLog {
            entries,
            samples: loss_meter.count(),
            batches,
        })
    }

    fn progress_bar(&self, total: Option<usize>, epoch: usize) -> Option<ProgressBar> {
        if !self.verbose {
            return None;
        }
        let pb = match total {
            Some(total) => ProgressBar::new(total as u64),
            None => ProgressBar::new_spinner(),
        };
        pb.set_style(
            ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        pb.set_prefix(format!("{} {epoch}", self.mode.stage()));
        Some(pb)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
