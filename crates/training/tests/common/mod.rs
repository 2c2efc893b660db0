#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, fs, path::Path};

use anyhow::Result;
use candle_core::{Device, Tensor};
use image::{GrayImage, Luma, Rgb, RgbImage};
use model::{build_model, snapshot_parameters, ChangeDetector, FusionForm, ModelSpec, SiameseUnet};
use training::{ChangeBatch, Metric, TrainingError};

pub fn tiny_model() -> Result<SiameseUnet> {
    tiny_model_with(true, 2)
}

pub fn tiny_model_with(siam_encoder: bool, classes: usize) -> Result<SiameseUnet> {
    let spec = ModelSpec {
        encoder_name: "unet-tiny".into(),
        encoder_weights: None,
        in_channels: 3,
        classes,
        siam_encoder,
        fusion_form: FusionForm::Concat,
        decoder_dropout: None,
    };
    Ok(build_model(&spec, &Device::Cpu)?)
}

/// Random image pair with a label marking the left half as changed.
pub fn random_batch(names: &[&str], size: usize) -> Result<ChangeBatch> {
    let batch = names.len();
    let pre = Tensor::randn(0f32, 1.0, (batch, 3, size, size), &Device::Cpu)?;
    let post = Tensor::randn(0f32, 1.0, (batch, 3, size, size), &Device::Cpu)?;
    let row: Vec<u32> = (0..size).map(|x| u32::from(x < size / 2)).collect();
    let label: Vec<u32> = row.iter().copied().cycle().take(batch * size * size).collect();
    Ok(ChangeBatch {
        pre,
        post,
        label: Tensor::from_vec(label, (batch, size, size), &Device::Cpu)?,
        names: names.iter().map(|n| n.to_string()).collect(),
    })
}

/// Flattened copy of every parameter, keyed by name.
pub fn parameter_values(model: &dyn ChangeDetector) -> Result<Vec<(String, Vec<f32>)>> {
    let mut values = snapshot_parameters(model)?
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.flatten_all()?.to_vec1::<f32>()?)))
        .collect::<Result<Vec<_>>>()?;
    values.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(values)
}

/// Metric that replays a fixed sequence of scores, one per batch.
pub struct ScriptedMetric {
    name: &'static str,
    scores: RefCell<VecDeque<f64>>,
}

impl ScriptedMetric {
    pub fn boxed(name: &'static str, scores: &[f64]) -> Box<dyn Metric> {
        Box::new(Self {
            name,
            scores: RefCell::new(scores.iter().copied().collect()),
        })
    }
}

impl Metric for ScriptedMetric {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, _logits: &Tensor, _target: &Tensor) -> Result<f64, TrainingError> {
        self.scores
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| TrainingError::runtime("scripted metric exhausted"))
    }
}

/// Writes a LEVIR-style split (`A/`, `B/`, `label/`) of square RGB tiles.
pub fn write_split(root: &Path, names: &[&str], size: u32) -> Result<()> {
    for dir in ["A", "B", "label"] {
        fs::create_dir_all(root.join(dir))?;
    }
    for (idx, name) in names.iter().enumerate() {
        let shade = (idx as u8).wrapping_mul(40);
        RgbImage::from_fn(size, size, |x, y| Rgb([shade, (x * 20) as u8, (y * 20) as u8]))
            .save(root.join("A").join(format!("{name}.png")))?;
        RgbImage::from_fn(size, size, |x, y| {
            if x < size / 2 {
                Rgb([255, 255, 255])
            } else {
                Rgb([shade, (x * 20) as u8, (y * 20) as u8])
            }
        })
        .save(root.join("B").join(format!("{name}.png")))?;
        GrayImage::from_fn(size, size, |x, _| Luma([if x < size / 2 { 255 } else { 0 }]))
            .save(root.join("label").join(format!("{name}.png")))?;
    }
    Ok(())
}
