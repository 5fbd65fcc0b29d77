use burn::prelude::*;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{DatasetError, PairDataset, PairItem};

#[derive(Config, Debug)]
pub struct PairLoaderConfig {
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = true)]
    pub shuffle: bool,
    #[config(default = 42)]
    pub seed: u64,
}

/// A stacked mini-batch: images are `[N, 3, H, W]`, labels `[N, 1]`.
#[derive(Clone, Debug)]
pub struct PairBatch<B: Backend> {
    pub images_a: Tensor<B, 4>,
    pub images_b: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
}

impl<B: Backend> PairBatch<B> {
    pub fn from_items(items: Vec<PairItem>, device: &B::Device) -> Self {
        assert!(!items.is_empty(), "cannot build a batch from zero pairs");
        let count = items.len();
        let mut images_a = Vec::with_capacity(count);
        let mut images_b = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        for item in items {
            images_a.push(item.image_a.to_tensor::<B>(device));
            images_b.push(item.image_b.to_tensor::<B>(device));
            labels.push(item.label);
        }

        Self {
            images_a: Tensor::stack(images_a, 0),
            images_b: Tensor::stack(images_b, 0),
            labels: Tensor::<B, 1>::from_floats(labels.as_slice(), device)
                .reshape([count as i32, 1]),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Yields the dataset in mini-batches, shuffled once per epoch.
///
/// The pairs of one batch may be decoded on several scoped worker threads; they are
/// always re-joined in sample order so a batch's contents only depend on the epoch's
/// permutation.
pub struct PairLoader<'a> {
    dataset: &'a PairDataset,
    config: PairLoaderConfig,
}

impl<'a> PairLoader<'a> {
    pub fn new(dataset: &'a PairDataset, config: PairLoaderConfig) -> Self {
        assert!(config.batch_size > 0, "batch size must be positive");
        Self { dataset, config }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    /// Sample order for `epoch`, deterministic in `(seed, epoch)`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            loader: self,
            order: self.epoch_order(epoch),
            cursor: 0,
        }
    }

    fn load(&self, indices: &[usize]) -> Result<Vec<PairItem>, DatasetError> {
        let workers = self.config.num_workers.clamp(1, indices.len().max(1));
        if workers == 1 {
            return indices.iter().map(|&index| self.dataset.get(index)).collect();
        }

        let chunk_size = indices.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = indices
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|&index| self.dataset.get(index))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();

            let mut items = Vec::with_capacity(indices.len());
            for handle in handles {
                match handle.join() {
                    Ok(chunk) => items.extend(chunk?),
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            Ok(items)
        })
    }
}

pub struct EpochBatches<'a> {
    loader: &'a PairLoader<'a>,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Vec<PairItem>, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.config.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.loader.load(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{PairRecord, PairTable},
        inference::ImageTransformConfig,
    };
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    type TestBackend = NdArray<f32>;

    fn dataset(dir: &Path, count: usize) -> PairDataset {
        let records = (0..count)
            .map(|idx| {
                let path = dir.join(format!("{idx}.png"));
                RgbImage::from_pixel(4, 4, Rgb([idx as u8 * 10, 0, 0]))
                    .save(&path)
                    .unwrap();
                PairRecord {
                    image_a: path.clone(),
                    image_b: path,
                    label: (idx % 2) as f32,
                }
            })
            .collect();
        let transform = ImageTransformConfig::new(4, 4)
            .with_mean([0.0; 3])
            .with_std([1.0; 3]);
        PairDataset::new(PairTable::new(records), transform)
    }

    fn first_pixel_indices(items: &[PairItem]) -> Vec<usize> {
        items
            .iter()
            .map(|item| (item.image_a.data[0] * 255.0 / 10.0).round() as usize)
            .collect()
    }

    #[test]
    fn epoch_covers_every_sample_once_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path(), 5);
        let loader = PairLoader::new(&dataset, PairLoaderConfig::new().with_batch_size(2));

        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<_> = loader.epoch(0).map(|batch| batch.unwrap()).collect();
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );

        let mut seen: Vec<usize> = batches.iter().flat_map(|b| first_pixel_indices(b)).collect();
        assert_eq!(seen, loader.epoch_order(0));
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn epoch_iterator_is_exported_from_data() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path(), 3);
        let loader = PairLoader::new(&dataset, PairLoaderConfig::new().with_batch_size(2));

        let mut batches: crate::data::EpochBatches<'_> = loader.epoch(1);
        assert_eq!(batches.next().unwrap().unwrap().len(), 2);
        assert_eq!(batches.next().unwrap().unwrap().len(), 1);
        assert!(batches.next().is_none());
    }

    #[test]
    fn shuffle_is_seeded_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path(), 16);
        let loader = PairLoader::new(&dataset, PairLoaderConfig::new().with_seed(7));
        let again = PairLoader::new(&dataset, PairLoaderConfig::new().with_seed(7));

        assert_eq!(loader.epoch_order(3), again.epoch_order(3));
        assert_ne!(loader.epoch_order(0), loader.epoch_order(1));

        let ordered = PairLoader::new(&dataset, PairLoaderConfig::new().with_shuffle(false));
        assert_eq!(ordered.epoch_order(5), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn parallel_workers_preserve_sample_order() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path(), 9);
        let config = PairLoaderConfig::new()
            .with_batch_size(9)
            .with_num_workers(4)
            .with_seed(3);
        let loader = PairLoader::new(&dataset, config);

        let batch = loader.epoch(0).next().unwrap().unwrap();
        assert_eq!(first_pixel_indices(&batch), loader.epoch_order(0));
    }

    #[test]
    fn missing_sample_stops_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = dataset(dir.path(), 2).table().records().to_vec();
        records[1].image_b = dir.path().join("gone.png");
        let dataset = PairDataset::new(PairTable::new(records), ImageTransformConfig::new(4, 4));
        let loader = PairLoader::new(
            &dataset,
            PairLoaderConfig::new()
                .with_batch_size(2)
                .with_num_workers(2),
        );

        let err = loader.epoch(0).next().unwrap().unwrap_err();
        assert!(matches!(err, DatasetError::MissingSample { index: 1, .. }));
    }

    #[test]
    fn batch_stacks_images_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path(), 3);
        let items = (0..3).map(|idx| dataset.get(idx).unwrap()).collect();
        let device = <TestBackend as Backend>::Device::default();

        let batch = PairBatch::<TestBackend>::from_items(items, &device);
        assert_eq!(batch.images_a.dims(), [3, 3, 4, 4]);
        assert_eq!(batch.images_b.dims(), [3, 3, 4, 4]);
        assert_eq!(batch.labels.dims(), [3, 1]);
        assert_eq!(
            batch.labels.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 0.0]
        );
    }
}
