mod common;

use std::{fs, path::Path};

use anyhow::Result;
use common::{parameter_values, tiny_model, tiny_model_with};
use model::{snapshot_parameters, ChangeDetector};
use training::{apply_model_weights, read_manifest, BestCheckpoint};

/// Shifts every parameter so two snapshots of the same model differ.
fn perturb(model: &dyn ChangeDetector) -> Result<()> {
    for (_, var) in model.parameters() {
        let shifted = (var.as_tensor() + 1.0)?;
        var.set(&shifted)?;
    }
    Ok(())
}

fn save(model: &dyn ChangeDetector, path: &Path) -> Result<()> {
    candle_core::safetensors::save(&snapshot_parameters(model)?, path)?;
    Ok(())
}

#[test]
fn equal_and_nan_scores_do_not_replace_the_best() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model = tiny_model()?;
    let mut checkpoint = BestCheckpoint::new(dir.path(), "fscore");

    assert!(checkpoint.consider(0.6, &model, 1)?);
    assert!(!checkpoint.consider(0.6, &model, 2)?);
    assert!(!checkpoint.consider(f64::NAN, &model, 3)?);
    assert!(!checkpoint.consider(0.2, &model, 4)?);

    assert_eq!(checkpoint.saves(), 1);
    assert_eq!(checkpoint.best_epoch(), Some(1));
    assert_eq!(read_manifest(dir.path(), "best_model")?.epoch, 1);
    Ok(())
}

#[test]
fn unwritable_directory_is_fatal_and_keeps_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let occupied = dir.path().join("checkpoints");
    fs::write(&occupied, "not a directory")?;
    let model = tiny_model()?;
    let mut checkpoint = BestCheckpoint::new(&occupied, "fscore");

    let err = checkpoint.consider(0.5, &model, 1).unwrap_err();

    assert!(err.to_string().contains("checkpoint directory"), "{err}");
    assert_eq!(checkpoint.best_score(), 0.0);
    assert_eq!(checkpoint.saves(), 0);
    assert_eq!(checkpoint.best_epoch(), None);
    Ok(())
}

#[test]
fn failed_manifest_swap_restores_previous_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model = tiny_model()?;
    let mut checkpoint = BestCheckpoint::new(dir.path(), "fscore");
    assert!(checkpoint.consider(0.4, &model, 1)?);
    let first_weights = fs::read(checkpoint.weights_path())?;

    // A non-empty directory where the manifest goes makes the final rename fail.
    fs::remove_file(checkpoint.manifest_path())?;
    fs::create_dir(checkpoint.manifest_path())?;
    fs::write(checkpoint.manifest_path().join("keep"), "x")?;
    perturb(&model)?;

    assert!(checkpoint.consider(0.9, &model, 2).is_err());

    assert_eq!(checkpoint.best_score(), 0.4);
    assert_eq!(checkpoint.saves(), 1);
    assert_eq!(fs::read(checkpoint.weights_path())?, first_weights);
    let leftovers: Vec<_> = fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp") || name.ends_with(".bak"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    Ok(())
}

#[test]
fn best_weights_reload_after_later_changes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model = tiny_model()?;
    let mut checkpoint = BestCheckpoint::new(dir.path(), "fscore");
    assert!(checkpoint.consider(0.5, &model, 1)?);
    let saved = parameter_values(&model)?;

    perturb(&model)?;
    assert_ne!(parameter_values(&model)?, saved);

    assert!(checkpoint.load_best_weights(&model)?);
    assert_eq!(parameter_values(&model)?, saved);
    Ok(())
}

#[test]
fn weights_missing_a_parameter_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shared.safetensors");
    save(&tiny_model_with(true, 2)?, &path)?;

    let twin = tiny_model_with(false, 2)?;
    let err = apply_model_weights(&twin, &path).unwrap_err();
    assert!(err.to_string().contains("missing parameter"), "{err}");
    Ok(())
}

#[test]
fn weights_with_extra_tensors_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("twin.safetensors");
    save(&tiny_model_with(false, 2)?, &path)?;

    let shared = tiny_model_with(true, 2)?;
    let err = apply_model_weights(&shared, &path).unwrap_err();
    assert!(err.to_string().contains("unused parameters"), "{err}");
    Ok(())
}

#[test]
fn weights_with_mismatched_shapes_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("three_class.safetensors");
    save(&tiny_model_with(true, 3)?, &path)?;

    let binary = tiny_model_with(true, 2)?;
    let err = apply_model_weights(&binary, &path).unwrap_err();
    assert!(err.to_string().contains("has shape"), "{err}");
    Ok(())
}

#[test]
fn matching_weights_apply_cleanly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("copy.safetensors");
    let source = tiny_model()?;
    save(&source, &path)?;

    let target = tiny_model()?;
    apply_model_weights(&target, &path)?;
    assert_eq!(parameter_values(&target)?, parameter_values(&source)?);
    Ok(())
}
