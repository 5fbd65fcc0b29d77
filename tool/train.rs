use std::{env, path::PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use burn::{backend::Autodiff, config::Config, tensor::backend::Backend};
use burn_disambiguation::{
    data::{PairDataset, PairTable},
    model::{DisambiguationModelConfig, backbone::BackboneVariant},
    train::{TrainingConfig, train},
};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, prelude::*};

#[cfg(feature = "backend_cuda")]
type TrainBackend = Autodiff<burn::backend::Cuda<f32>>;

#[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
type TrainBackend = Autodiff<burn::backend::Wgpu<f32>>;

#[cfg(not(any(feature = "backend_wgpu", feature = "backend_cuda")))]
type TrainBackend = Autodiff<burn::backend::NdArray<f32>>;

/// Resolution used when no config file is given.
const DEFAULT_IMAGE_SIZE: usize = 224;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Train the depth-guided image-pair disambiguation classifier"
)]
struct Args {
    /// CSV with the header `Image1,Image2,Label`.
    #[arg(long, value_name = "PATH")]
    pairs: PathBuf,

    /// JSON `TrainingConfig`; flags below override its fields.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// DINOv2 backbone size; defaults to `base` when no config file is given.
    #[arg(long, value_enum)]
    backbone: Option<BackboneArg>,

    /// Directory relative image paths are resolved against.
    #[arg(long, value_name = "DIR")]
    image_root: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    epochs: Option<usize>,

    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    #[arg(long, value_name = "F")]
    learning_rate: Option<f64>,

    #[arg(long, value_name = "PATH")]
    backbone_weights: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    depth_weights: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    #[arg(long, value_name = "N")]
    seed: Option<u64>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackboneArg {
    Small,
    Base,
    Large,
}

impl From<BackboneArg> for BackboneVariant {
    fn from(arg: BackboneArg) -> Self {
        match arg {
            BackboneArg::Small => BackboneVariant::Small,
            BackboneArg::Base => BackboneVariant::Base,
            BackboneArg::Large => BackboneVariant::Large,
        }
    }
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .map_err(|err| anyhow!("{err}"))
                .with_context(|| format!("failed to load config file '{}'", path.display()))?,
            None => TrainingConfig::new(
                DisambiguationModelConfig::new(DEFAULT_IMAGE_SIZE, DEFAULT_IMAGE_SIZE)
                    .with_variant(BackboneVariant::Base),
            ),
        };

        if let Some(backbone) = self.backbone {
            config.model = config.model.with_variant(backbone.into());
        }
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        ensure!(config.batch_size > 0, "batch size must be positive");
        ensure!(config.num_workers > 0, "worker count must be positive");
        Ok(config)
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env();
    let filter = if env::var("RUST_LOG").is_err() {
        filter.add_directive(LevelFilter::INFO.into())
    } else {
        filter
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .init();

    let args = Args::parse();
    let config = args.training_config()?;

    let mut table = PairTable::from_csv(&args.pairs)
        .with_context(|| format!("failed to read pair table '{}'", args.pairs.display()))?;
    if let Some(root) = &args.image_root {
        table = table.with_image_root(root);
    }
    info!("loaded {} pairs from {}", table.len(), args.pairs.display());
    let dataset = PairDataset::new(table, config.transform());

    let device = <TrainBackend as Backend>::Device::default();
    let model = config
        .model
        .init::<TrainBackend>(&device)
        .load_pretrained(
            args.backbone_weights.as_deref(),
            args.depth_weights.as_deref(),
            &device,
        )
        .context("failed to load pretrained weights")?;

    let (_model, report) = train(&config, model, &dataset, &device).context("training failed")?;
    if let Some(mean) = report
        .batch_losses
        .len()
        .checked_sub(1)
        .and_then(|last| report.epoch_mean(last))
    {
        info!("finished {} steps, final epoch mean loss {mean:.4}", report.num_steps());
    }

    Ok(())
}
