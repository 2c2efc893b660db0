use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{build_model, snapshot_parameters, ChangeDetector, FusionForm, ModelSpec};

fn tiny_spec(fusion_form: FusionForm, siam_encoder: bool) -> ModelSpec {
    ModelSpec {
        encoder_name: "unet-tiny".into(),
        encoder_weights: None,
        in_channels: 3,
        classes: 2,
        siam_encoder,
        fusion_form,
        decoder_dropout: None,
    }
}

fn image_pair(batch: usize, size: usize) -> Result<(Tensor, Tensor)> {
    let pre = Tensor::randn(0f32, 1.0, (batch, 3, size, size), &Device::Cpu)?;
    let post = Tensor::randn(0f32, 1.0, (batch, 3, size, size), &Device::Cpu)?;
    Ok((pre, post))
}

#[test]
fn forward_produces_class_logits() -> Result<()> {
    let model = build_model(&tiny_spec(FusionForm::Concat, true), &Device::Cpu)?;
    let (pre, post) = image_pair(2, 8)?;

    let logits = model.forward(&pre, &post)?;

    assert_eq!(logits.dims(), &[2, 2, 8, 8]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn every_fusion_form_builds_and_runs() -> Result<()> {
    for fusion in [
        FusionForm::Concat,
        FusionForm::Sum,
        FusionForm::Diff,
        FusionForm::AbsDiff,
    ] {
        let model = build_model(&tiny_spec(fusion, true), &Device::Cpu)?;
        let (pre, post) = image_pair(1, 4)?;
        let logits = model.forward(&pre, &post)?;
        assert_eq!(logits.dims(), &[1, 2, 4, 4], "fusion {fusion}");
    }
    Ok(())
}

#[test]
fn twin_encoders_double_encoder_parameters() -> Result<()> {
    let shared = build_model(&tiny_spec(FusionForm::Concat, true), &Device::Cpu)?;
    let twin = build_model(&tiny_spec(FusionForm::Concat, false), &Device::Cpu)?;

    let count = |names: Vec<String>, prefix: &str| names.iter().filter(|n| n.starts_with(prefix)).count();
    let shared_names: Vec<String> = shared.parameters().into_iter().map(|(n, _)| n).collect();
    let twin_names: Vec<String> = twin.parameters().into_iter().map(|(n, _)| n).collect();

    assert_eq!(count(shared_names.clone(), "encoder_post."), 0);
    assert_eq!(
        count(twin_names.clone(), "encoder_post."),
        count(shared_names, "encoder.")
    );
    assert!(twin_names.windows(2).all(|w| w[0] <= w[1]), "parameters sorted");
    Ok(())
}

#[test]
fn rejects_mismatched_pair_and_bad_sizes() -> Result<()> {
    let model = build_model(&tiny_spec(FusionForm::Concat, true), &Device::Cpu)?;
    let pre = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu)?;
    let post = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&pre, &post).is_err());

    let odd = Tensor::zeros((1, 3, 5, 5), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&odd, &odd).is_err());

    let gray = Tensor::zeros((1, 1, 8, 8), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&gray, &gray).is_err());
    Ok(())
}

#[test]
fn unknown_encoder_is_rejected() {
    let mut spec = tiny_spec(FusionForm::Concat, true);
    spec.encoder_name = "resnet34".into();
    assert!(build_model(&spec, &Device::Cpu).is_err());
}

#[test]
fn encoder_weights_are_loaded_from_safetensors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = build_model(&tiny_spec(FusionForm::Concat, true), &Device::Cpu)?;
    let encoder_tensors: HashMap<String, Tensor> = snapshot_parameters(&source)?
        .into_iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix("encoder.")
                .map(|key| (key.to_string(), tensor))
        })
        .collect();
    let path = dir.path().join("encoder.safetensors");
    candle_core::safetensors::save(&encoder_tensors, &path)?;

    let mut spec = tiny_spec(FusionForm::Concat, false);
    spec.encoder_weights = Some(path);
    let loaded = build_model(&spec, &Device::Cpu)?;

    let params: HashMap<String, Tensor> = snapshot_parameters(&loaded)?;
    for (key, expected) in &encoder_tensors {
        for prefix in ["encoder.", "encoder_post."] {
            let actual = &params[&format!("{prefix}{key}")];
            let diff = (actual - expected)?.abs()?.sum_all()?.to_vec0::<f32>()?;
            assert_eq!(diff, 0.0, "{prefix}{key}");
        }
    }
    Ok(())
}
