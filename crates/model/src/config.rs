use std::{fmt, path::PathBuf, str::FromStr};

use candle_core::{DType, Device, Error, Result};

/// How the pre- and post-change feature maps are merged at every skip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionForm {
    Concat,
    Sum,
    Diff,
    AbsDiff,
}

impl FusionForm {
    /// Channel count of a fused feature map built from two `channels`-wide inputs.
    pub fn fused_channels(self, channels: usize) -> usize {
        match self {
            FusionForm::Concat => channels * 2,
            FusionForm::Sum | FusionForm::Diff | FusionForm::AbsDiff => channels,
        }
    }
}

impl FromStr for FusionForm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "concat" => Ok(FusionForm::Concat),
            "sum" | "add" => Ok(FusionForm::Sum),
            "diff" => Ok(FusionForm::Diff),
            "abs_diff" | "absdiff" => Ok(FusionForm::AbsDiff),
            other => Err(Error::Msg(format!("unsupported fusion_form '{other}'"))),
        }
    }
}

impl fmt::Display for FusionForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FusionForm::Concat => "concat",
            FusionForm::Sum => "sum",
            FusionForm::Diff => "diff",
            FusionForm::AbsDiff => "abs_diff",
        };
        f.write_str(name)
    }
}

/// Factory inputs for [`crate::build_model`].
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub encoder_name: String,
    /// Optional safetensors file whose tensors initialise the encoder.
    pub encoder_weights: Option<PathBuf>,
    pub in_channels: usize,
    pub classes: usize,
    pub siam_encoder: bool,
    pub fusion_form: FusionForm,
    pub decoder_dropout: Option<f32>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            encoder_name: "unet".to_string(),
            encoder_weights: None,
            in_channels: 3,
            classes: 2,
            siam_encoder: true,
            fusion_form: FusionForm::Concat,
            decoder_dropout: None,
        }
    }
}

/// Resolved configuration used to assemble the network.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Output channels of each encoder stage, shallowest first.
    pub encoder_channels: Vec<usize>,
    pub in_channels: usize,
    pub classes: usize,
    pub siam_encoder: bool,
    pub fusion_form: FusionForm,
    pub decoder_dropout_p: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn from_spec(spec: &ModelSpec, device: Device) -> Result<Self> {
        let encoder_channels = encoder_channels(&spec.encoder_name)?;
        let config = Self {
            encoder_channels,
            in_channels: spec.in_channels,
            classes: spec.classes,
            siam_encoder: spec.siam_encoder,
            fusion_form: spec.fusion_form,
            decoder_dropout_p: spec.decoder_dropout,
            dtype: DType::F32,
            device,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder_channels.is_empty() {
            return Err(Error::Msg("encoder requires at least one stage".into()));
        }
        if self.encoder_channels.iter().any(|&c| c == 0) {
            return Err(Error::Msg(
                "encoder stage channels must be greater than zero".into(),
            ));
        }
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.classes == 0 {
            return Err(Error::Msg("classes must be greater than zero".into()));
        }
        if self.dtype != DType::F32 {
            return Err(Error::Msg(format!(
                "only f32 parameters are supported (got {:?})",
                self.dtype
            )));
        }
        if let Some(p) = self.decoder_dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("decoder_dropout_p must be in [0, 1)".into()));
            }
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.encoder_channels.len()
    }

    /// Spatial sizes must be multiples of this value.
    pub fn size_divisor(&self) -> usize {
        1 << (self.depth() - 1)
    }
}

/// Stage widths for the known encoder names.
pub fn encoder_channels(name: &str) -> Result<Vec<usize>> {
    match name.to_ascii_lowercase().as_str() {
        "unet" => Ok(vec![32, 64, 128, 256, 512]),
        "unet-small" => Ok(vec![16, 32, 64, 128]),
        "unet-tiny" => Ok(vec![4, 8]),
        other => Err(Error::Msg(format!(
            "unknown encoder '{other}' (expected unet, unet-small or unet-tiny)"
        ))),
    }
}
