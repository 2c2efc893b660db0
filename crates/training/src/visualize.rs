//! Sliding-window inference over the validation split, written out as change maps.

use std::path::PathBuf;

use candle_core::Tensor;
use change_data::{save_change_map, LabelMap};
use model::ChangeDetector;

use crate::{
    config::VisualizationConfig,
    data::{BlockingDataLoader, DataLoader},
    metrics::argmax_classes,
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct VisualizationSettings {
    pub save_dir: PathBuf,
    pub window_size: usize,
    /// Expected sample side; other sizes are still processed.
    pub image_size: usize,
}

impl From<&VisualizationConfig> for VisualizationSettings {
    fn from(config: &VisualizationConfig) -> Self {
        Self {
            save_dir: config.save_dir.clone(),
            window_size: config.window_size,
            image_size: config.image_size,
        }
    }
}

/// Top-left offsets of the tiles covering `size` pixels. The last tile is
/// shifted back so it ends on the border instead of running past it.
pub fn window_origins(size: usize, window: usize) -> Vec<usize> {
    if window == 0 || size <= window {
        return vec![0];
    }
    let mut origins: Vec<usize> = (0..size - window).step_by(window).collect();
    origins.push(size - window);
    origins
}

/// Predicts a full-resolution change map for one `(1, C, H, W)` image pair.
pub fn predict_sliding<M>(
    model: &M,
    pre: &Tensor,
    post: &Tensor,
    window: usize,
) -> Result<LabelMap, TrainingError>
where
    M: ChangeDetector + ?Sized,
{
    let (batch, _, height, width) = pre.dims4().map_err(to_runtime_error)?;
    if batch != 1 || pre.dims() != post.dims() {
        return Err(TrainingError::runtime(format!(
            "sliding-window inference expects matching (1, C, H, W) inputs, got {:?} and {:?}",
            pre.dims(),
            post.dims()
        )));
    }

    let tile_h = window.min(height);
    let tile_w = window.min(width);
    let mut data = vec![0u32; height * width];
    for y in window_origins(height, tile_h) {
        for x in window_origins(width, tile_w) {
            let crop = |t: &Tensor| -> Result<Tensor, TrainingError> {
                t.narrow(2, y, tile_h)
                    .and_then(|t| t.narrow(3, x, tile_w))
                    .map_err(to_runtime_error)
            };
            let logits = model
                .forward(&crop(pre)?, &crop(post)?)
                .map_err(to_runtime_error)?;
            let classes = argmax_classes(&logits)?
                .squeeze(0)
                .and_then(|t| t.to_vec2::<u32>())
                .map_err(to_runtime_error)?;
            for (dy, row) in classes.iter().enumerate() {
                let offset = (y + dy) * width + x;
                data[offset..offset + row.len()].copy_from_slice(row);
            }
        }
    }

    Ok(LabelMap {
        data,
        height,
        width,
    })
}

/// Writes `<save_dir>/<name>.png` for every sample the loader yields and
/// returns how many maps were written.
pub fn visualize<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    settings: &VisualizationSettings,
) -> Result<usize, TrainingError>
where
    M: ChangeDetector + ?Sized,
    L: DataLoader,
{
    if settings.window_size == 0 {
        return Err(TrainingError::runtime("window_size must be greater than 0"));
    }

    let was_training = model.is_training();
    model.set_training(false);
    let outcome = write_maps(model, loader, settings);
    model.set_training(was_training);

    let written = outcome?;
    println!(
        "[training] wrote {} change map(s) to {}",
        written,
        settings.save_dir.display()
    );
    Ok(written)
}

fn write_maps<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    settings: &VisualizationSettings,
) -> Result<usize, TrainingError>
where
    M: ChangeDetector + ?Sized,
    L: DataLoader,
{
    loader.start_epoch(0)?;
    let mut written = 0;
    while let Some(batch) = loader.next_batch()? {
        for (idx, name) in batch.names.iter().enumerate() {
            let pick = |t: &Tensor| t.narrow(0, idx, 1).map_err(to_runtime_error);
            let (pre, post) = (pick(&batch.pre)?, pick(&batch.post)?);
            let (_, _, height, width) = pre.dims4().map_err(to_runtime_error)?;
            if height != settings.image_size || width != settings.image_size {
                println!(
                    "[training] {name} is {height}x{width}, expected {0}x{0}",
                    settings.image_size
                );
            }

            let map = predict_sliding(model, &pre, &post, settings.window_size)?;
            save_change_map(&settings.save_dir.join(format!("{name}.png")), &map)?;
            written += 1;
        }
    }
    Ok(written)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
