pub mod block;
pub mod config;
pub mod model;

pub use block::{ConvBlock, Encoder};
pub use config::{encoder_channels, FusionForm, ModelConfig, ModelSpec};
pub use model::{snapshot_parameters, ChangeDetector, SiameseUnet};

use candle_core::{Device, Result};

/// Builds a [`SiameseUnet`] from factory inputs, loading encoder weights when given.
pub fn build_model(spec: &ModelSpec, device: &Device) -> Result<SiameseUnet> {
    let config = ModelConfig::from_spec(spec, device.clone())?;
    let model = SiameseUnet::new(config)?;
    if let Some(path) = spec.encoder_weights.as_deref() {
        model.load_encoder_weights(path)?;
    }
    Ok(model)
}
