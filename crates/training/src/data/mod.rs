use candle_core::{Device, Tensor};
use change_data::{ChangeDetectionDataset, ChangeSample, DatasetError};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Stacked pre/post images `(B, C, H, W)` and labels `(B, H, W)`.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub pre: Tensor,
    pub post: Tensor,
    pub label: Tensor,
    pub names: Vec<String>,
}

impl ChangeBatch {
    pub fn from_samples(samples: &[ChangeSample], device: &Device) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| TrainingError::runtime("cannot collate an empty batch"))?;
        let (channels, height, width) = (first.pre.channels, first.pre.height, first.pre.width);

        let plane = channels * height * width;
        let mut pre = Vec::with_capacity(samples.len() * plane);
        let mut post = Vec::with_capacity(samples.len() * plane);
        let mut label = Vec::with_capacity(samples.len() * height * width);
        let mut names = Vec::with_capacity(samples.len());
        for sample in samples {
            if (sample.pre.channels, sample.pre.height, sample.pre.width)
                != (channels, height, width)
            {
                return Err(DatasetError::Shape {
                    name: sample.name.clone(),
                    detail: format!(
                        "sample is {}x{}x{} but batch is {}x{}x{}",
                        sample.pre.channels,
                        sample.pre.height,
                        sample.pre.width,
                        channels,
                        height,
                        width
                    ),
                }
                .into());
            }
            pre.extend_from_slice(&sample.pre.data);
            post.extend_from_slice(&sample.post.data);
            label.extend_from_slice(&sample.label.data);
            names.push(sample.name.clone());
        }

        let batch = samples.len();
        let to_tensor_error =
            |err: candle_core::Error| TrainingError::runtime(format!("failed to collate batch: {err}"));
        Ok(Self {
            pre: Tensor::from_vec(pre, (batch, channels, height, width), device)
                .map_err(to_tensor_error)?,
            post: Tensor::from_vec(post, (batch, channels, height, width), device)
                .map_err(to_tensor_error)?,
            label: Tensor::from_vec(label, (batch, height, width), device)
                .map_err(to_tensor_error)?,
            names,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.names.len()
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    /// Rewinds the loader for the given 1-based epoch.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ChangeBatch>>>;

    /// Batches per epoch, when known up front.
    fn batches_per_epoch(&self) -> Option<usize> {
        None
    }
}

impl<L> DataLoader for Box<L>
where
    L: DataLoader + ?Sized,
{
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ChangeBatch>>> {
        (**self).next_batch()
    }

    fn batches_per_epoch(&self) -> Option<usize> {
        (**self).batches_per_epoch()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn batches_per_epoch(&self) -> Option<usize> {
        self.inner.batches_per_epoch()
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Batches a [`ChangeDetectionDataset`], reshuffling each epoch unless the
/// split is in test mode.
pub struct ChangeDetectionLoader {
    dataset: ChangeDetectionDataset,
    device: Device,
    batch_size: usize,
    drop_last: bool,
    shuffle: bool,
    seed: u64,
    order: Vec<usize>,
    cursor: usize,
}

impl ChangeDetectionLoader {
    pub fn new(
        dataset: ChangeDetectionDataset,
        batch_size: usize,
        drop_last: bool,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "dataset under {} contains no samples",
                dataset.config().root.display()
            )));
        }

        let shuffle = dataset.shuffle_enabled();
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            device,
            batch_size,
            drop_last,
            shuffle,
            seed,
            order,
            cursor: 0,
        })
    }

    pub fn dataset(&self) -> &ChangeDetectionDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample indices in the order the current epoch visits them.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn build_batch(&mut self) -> Result<Option<ChangeBatch>> {
        let total = self.order.len();
        if self.cursor >= total {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(total);
        if self.drop_last && end - self.cursor < self.batch_size {
            self.cursor = total;
            return Ok(None);
        }

        let samples = self.order[self.cursor..end]
            .iter()
            .map(|&idx| self.dataset.get(idx))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.cursor = end;

        ChangeBatch::from_samples(&samples, &self.device).map(Some)
    }
}

impl DataLoader for ChangeDetectionLoader {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ChangeBatch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn batches_per_epoch(&self) -> Option<usize> {
        let n = self.dataset.len();
        Some(if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        })
    }
}

/// Replays a fixed list of batches every epoch.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    batches: Vec<ChangeBatch>,
    cursor: usize,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<ChangeBatch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataLoader for InMemoryLoader {
    fn start_epoch(&mut self, _epoch: usize) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ChangeBatch>>> {
        Box::pin(async move {
            let batch = self.batches.get(self.cursor).cloned();
            if batch.is_some() {
                self.cursor += 1;
            }
            Ok(batch)
        })
    }

    fn batches_per_epoch(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use change_data::{ImageTensor, LabelMap};

    fn sample(name: &str, value: f32, size: usize) -> ChangeSample {
        let image = |v: f32| ImageTensor {
            data: vec![v; 3 * size * size],
            channels: 3,
            height: size,
            width: size,
        };
        ChangeSample {
            name: name.into(),
            pre: image(value),
            post: image(-value),
            label: LabelMap {
                data: vec![1; size * size],
                height: size,
                width: size,
            },
        }
    }

    #[test]
    fn collates_samples_channel_first() {
        let batch =
            ChangeBatch::from_samples(&[sample("a", 1.0, 2), sample("b", 2.0, 2)], &Device::Cpu)
                .unwrap();
        assert_eq!(batch.pre.dims(), &[2, 3, 2, 2]);
        assert_eq!(batch.label.dims(), &[2, 2, 2]);
        assert_eq!(batch.names, vec!["a", "b"]);
        let second = batch.post.get(1).unwrap().flatten_all().unwrap();
        assert!(second.to_vec1::<f32>().unwrap().iter().all(|v| *v == -2.0));
    }

    #[test]
    fn rejects_mixed_sizes() {
        let err = ChangeBatch::from_samples(&[sample("a", 1.0, 2), sample("b", 1.0, 4)], &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Data(DatasetError::Shape { .. })));
    }

    #[test]
    fn in_memory_loader_replays_each_epoch() {
        let batch = ChangeBatch::from_samples(&[sample("a", 1.0, 2)], &Device::Cpu).unwrap();
        let mut loader = BlockingDataLoader::new(InMemoryLoader::new(vec![batch.clone(), batch]));
        for epoch in 1..=2 {
            loader.start_epoch(epoch).unwrap();
            let mut seen = 0;
            while loader.next_batch().unwrap().is_some() {
                seen += 1;
            }
            assert_eq!(seen, 2);
        }
    }
}
