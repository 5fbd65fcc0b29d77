use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{activation::log_sigmoid, backend::AutodiffBackend},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    data::{DatasetError, PairBatch, PairDataset, PairLoader, PairLoaderConfig},
    inference::ImageTransformConfig,
    model::{DisambiguationModel, DisambiguationModelConfig, encoder::EncodedImages},
};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: DisambiguationModelConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = true)]
    pub shuffle: bool,
}

impl TrainingConfig {
    pub fn loader_config(&self) -> PairLoaderConfig {
        PairLoaderConfig::new()
            .with_batch_size(self.batch_size)
            .with_num_workers(self.num_workers)
            .with_shuffle(self.shuffle)
            .with_seed(self.seed)
    }

    /// Image transform matching the resolution the classifier is sized for.
    pub fn transform(&self) -> ImageTransformConfig {
        ImageTransformConfig::new(self.model.image_height, self.model.image_width)
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("the pair dataset is empty")]
    EmptyDataset,
    #[error(
        "dataset images are {dataset:?} (height, width) but the model was configured for {model:?}"
    )]
    ResolutionMismatch {
        dataset: (usize, usize),
        model: (usize, usize),
    },
    #[error("loss became non-finite at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize },
}

/// Loss of every optimizer step, grouped by epoch.
#[derive(Clone, Debug, Default)]
pub struct TrainingReport {
    pub batch_losses: Vec<Vec<f32>>,
}

impl TrainingReport {
    pub fn num_steps(&self) -> usize {
        self.batch_losses.iter().map(Vec::len).sum()
    }

    pub fn epoch_mean(&self, epoch: usize) -> Option<f32> {
        let losses = self.batch_losses.get(epoch)?;
        if losses.is_empty() {
            return None;
        }
        Some(losses.iter().sum::<f32>() / losses.len() as f32)
    }
}

/// Mean binary cross-entropy between `sigmoid(logits)` and `targets`, both `[N, 1]`.
///
/// Computed as `-(t * log σ(x) + (1 - t) * log σ(-x))` so saturated logits stay finite.
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    assert_eq!(
        logits.dims(),
        targets.dims(),
        "logits and targets must have equal shape"
    );
    let log_p = log_sigmoid(logits.clone());
    let log_not_p = log_sigmoid(logits.neg());
    let negatives = targets.clone().neg().add_scalar(1.0);

    (targets * log_p + negatives * log_not_p).neg().mean()
}

/// Runs the epoch loop: forward, BCE against the labels, backward and one Adam step per
/// mini-batch, printing `Epoch [i/N], Loss: v` after every batch.
///
/// The frozen encoder runs on the inner backend so no graph is recorded for it; only the
/// projection and classifier receive gradients.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    mut model: DisambiguationModel<B>,
    dataset: &PairDataset,
    device: &B::Device,
) -> Result<(DisambiguationModel<B>, TrainingReport), TrainError> {
    if dataset.is_empty() {
        return Err(TrainError::EmptyDataset);
    }
    let transform = dataset.transform();
    let expected = (config.model.image_height, config.model.image_width);
    if (transform.height, transform.width) != expected {
        return Err(TrainError::ResolutionMismatch {
            dataset: (transform.height, transform.width),
            model: expected,
        });
    }

    let loader = PairLoader::new(dataset, config.loader_config());
    let mut optim = config.optimizer.init::<B, DisambiguationModel<B>>();
    let encoder = model.encoder().clone().valid();
    let mut report = TrainingReport::default();

    info!(
        "training on {} pairs for {} epochs ({} batches per epoch, lr {})",
        dataset.len(),
        config.num_epochs,
        loader.num_batches(),
        config.learning_rate
    );

    for epoch in 0..config.num_epochs {
        let mut losses = Vec::with_capacity(loader.num_batches());

        for (batch_index, items) in loader.epoch(epoch).enumerate() {
            let batch = PairBatch::<B::InnerBackend>::from_items(items?, device);
            let encoded_a = EncodedImages::<B>::from_inner(encoder.encode(batch.images_a));
            let encoded_b = EncodedImages::<B>::from_inner(encoder.encode(batch.images_b));
            let labels = Tensor::<B, 2>::from_inner(batch.labels);

            let logits = model.forward_encoded(encoded_a, encoded_b);
            let loss = binary_cross_entropy_with_logits(logits, labels);
            let loss_value = loss.clone().into_scalar().elem::<f32>();
            if !loss_value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    epoch: epoch + 1,
                    batch: batch_index + 1,
                });
            }

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            println!(
                "Epoch [{}/{}], Loss: {:.4}",
                epoch + 1,
                config.num_epochs,
                loss_value
            );
            debug!(epoch = epoch + 1, batch = batch_index + 1, loss = loss_value);
            losses.push(loss_value);
        }

        report.batch_losses.push(losses);
        if let Some(mean) = report.epoch_mean(epoch) {
            info!("epoch {} done, mean loss {mean:.4}", epoch + 1);
        }
    }

    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{PairRecord, PairTable},
        inference::classify_paths,
        model::{backbone::BackboneConfig, depth::{DepthActivation, DepthHeadConfig}},
    };
    use burn::backend::{Autodiff, NdArray};
    use image::{Rgb, RgbImage};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::{fs, path::Path};

    type InnerBackend = NdArray<f32>;
    type TrainBackend = Autodiff<InnerBackend>;

    fn tiny_training_config() -> TrainingConfig {
        let model = DisambiguationModelConfig::new(28, 28)
            .with_backbone(BackboneConfig::new().with_image_size(28))
            .with_depth_head(
                DepthHeadConfig::new()
                    .with_features(8)
                    .with_out_channels([8, 8, 8, 8])
                    .with_activation(DepthActivation::Sigmoid),
            )
            .with_hidden_size(16);
        TrainingConfig::new(model)
            .with_batch_size(2)
            .with_learning_rate(1e-3)
    }

    fn noise_image(path: &Path, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let image = RgbImage::from_fn(28, 28, |_, _| Rgb([rng.random(), rng.random(), rng.random()]));
        image.save(path).unwrap();
    }

    fn write_pairs(dir: &Path, rows: &[(&str, &str, u8)]) -> PairDataset {
        let mut csv = String::from("Image1,Image2,Label\n");
        for (a, b, label) in rows {
            csv.push_str(&format!("{a},{b},{label}\n"));
        }
        let table_path = dir.join("pairs.csv");
        fs::write(&table_path, csv).unwrap();

        let table = PairTable::from_csv(&table_path).unwrap().with_image_root(dir);
        PairDataset::new(table, tiny_training_config().transform())
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = <InnerBackend as Backend>::Device::default();
        let logits = Tensor::<InnerBackend, 1>::from_floats([0.0, 2.0, -3.0], &device).reshape([3, 1]);
        let targets = Tensor::<InnerBackend, 1>::from_floats([1.0, 0.0, 0.0], &device).reshape([3, 1]);

        let loss = binary_cross_entropy_with_logits(logits, targets)
            .into_scalar()
            .elem::<f32>();
        let expected = (2f32.ln() + (1.0 + 2f32.exp()).ln() + (1.0 + (-3f32).exp()).ln()) / 3.0;
        assert!((loss - expected).abs() < 1e-5, "loss {loss} != {expected}");
    }

    #[test]
    fn bce_stays_finite_for_saturated_logits() {
        let device = <InnerBackend as Backend>::Device::default();
        let logits = Tensor::<InnerBackend, 1>::from_floats([200.0, -200.0], &device).reshape([2, 1]);
        let targets = Tensor::<InnerBackend, 1>::from_floats([0.0, 1.0], &device).reshape([2, 1]);

        let loss = binary_cross_entropy_with_logits(logits, targets)
            .into_scalar()
            .elem::<f32>();
        assert!(loss.is_finite());
        assert!((loss - 200.0).abs() < 1e-3);
    }

    #[test]
    fn training_config_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        let config = tiny_training_config().with_num_epochs(3);
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.num_epochs, 3);
        assert_eq!(loaded.batch_size, 2);
        assert_eq!(loaded.model.hidden_size, 16);
        assert_eq!(loaded.loader_config().seed, 42);
    }

    #[test]
    fn overfits_a_handful_of_pairs() {
        let dir = tempfile::tempdir().unwrap();
        for (seed, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            noise_image(&dir.path().join(format!("{name}.png")), seed as u64);
        }
        let dataset = write_pairs(
            dir.path(),
            &[
                ("a.png", "a.png", 1),
                ("b.png", "b.png", 1),
                ("c.png", "d.png", 0),
                ("e.png", "f.png", 0),
            ],
        );

        let device = <TrainBackend as Backend>::Device::default();
        let config = tiny_training_config().with_num_epochs(80);
        let model = config.model.init::<TrainBackend>(&device);
        let (model, report) = train(&config, model, &dataset, &device).unwrap();

        assert_eq!(report.batch_losses.len(), 80);
        assert_eq!(report.num_steps(), 160);
        let first = report.epoch_mean(0).unwrap();
        let last = report.epoch_mean(79).unwrap();
        assert!(last < first, "loss did not decrease: {first} -> {last}");

        let model = model.valid();
        let transform = config.transform();
        for record in dataset.table().records() {
            let probability = classify_paths(
                &model,
                &transform,
                &record.image_a,
                &record.image_b,
                &device,
            )
            .unwrap();
            if record.label > 0.5 {
                assert!(probability > 0.5, "{record:?} scored {probability}");
            } else {
                assert!(probability < 0.5, "{record:?} scored {probability}");
            }
        }
    }

    #[test]
    fn missing_image_stops_training() {
        let dir = tempfile::tempdir().unwrap();
        noise_image(&dir.path().join("a.png"), 0);
        let dataset = write_pairs(dir.path(), &[("a.png", "gone.png", 0)]);

        let device = <TrainBackend as Backend>::Device::default();
        let config = tiny_training_config().with_num_epochs(1);
        let model = config.model.init::<TrainBackend>(&device);

        match train(&config, model, &dataset, &device) {
            Err(TrainError::Dataset(DatasetError::MissingSample { index, path })) => {
                assert_eq!(index, 0);
                assert!(path.ends_with("gone.png"));
            }
            other => panic!("expected a missing sample error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let dataset = PairDataset::new(PairTable::new(Vec::new()), tiny_training_config().transform());

        let device = <TrainBackend as Backend>::Device::default();
        let config = tiny_training_config();
        let model = config.model.init::<TrainBackend>(&device);
        assert!(matches!(
            train(&config, model, &dataset, &device),
            Err(TrainError::EmptyDataset)
        ));
    }

    #[test]
    fn mismatched_resolution_is_rejected() {
        let table = PairTable::new(vec![PairRecord {
            image_a: "a.png".into(),
            image_b: "b.png".into(),
            label: 1.0,
        }]);
        let dataset = PairDataset::new(table, ImageTransformConfig::new(14, 14));

        let device = <TrainBackend as Backend>::Device::default();
        let config = tiny_training_config();
        let model = config.model.init::<TrainBackend>(&device);
        match train(&config, model, &dataset, &device) {
            Err(TrainError::ResolutionMismatch { dataset, model }) => {
                assert_eq!(dataset, (14, 14));
                assert_eq!(model, (28, 28));
            }
            other => panic!("expected a resolution mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
