use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{
    overrides::{apply_overrides, ConfigOverride},
    Trainer, TrainingConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Siamese change-detection training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON training config; built-in LEVIR-CD defaults when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, value_name = "N", help = "Number of epochs to train")]
    epochs: Option<usize>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    let mut config = apply_overrides(config, &args.overrides)?;
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    config.validate()?;

    let mut trainer = Trainer::from_config(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received; stopping after the current epoch");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let report = trainer.fit_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    println!(
        "finished {} epoch(s): best score {:.4} at epoch {} ({} snapshot(s) saved{})",
        report.epochs.len(),
        report.best_score,
        report
            .best_epoch
            .map_or_else(|| "-".to_string(), |epoch| epoch.to_string()),
        report.saves,
        report
            .visualized
            .map(|n| format!(", {n} change map(s) written"))
            .unwrap_or_default()
    );

    Ok(())
}
