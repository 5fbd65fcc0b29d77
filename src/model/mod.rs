pub mod backbone;
pub mod classifier;
pub mod depth;
pub mod encoder;
pub mod fusion;
pub mod interpolate;
pub mod padding;

use std::path::{Path, PathBuf};

use burn::{
    module::{Ignored, Module},
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::activation::sigmoid,
};
use thiserror::Error;
use tracing::{info, warn};

use backbone::{BackboneConfig, BackboneVariant};
use classifier::{ClassifierHead, ClassifierHeadConfig};
use depth::DepthHeadConfig;
use encoder::{DepthGuidedEncoder, EncodedImages};
use interpolate::DepthResample;

mod stack_guard {
    #[cfg(not(target_arch = "wasm32"))]
    use stacker::maybe_grow;

    #[cfg(not(target_arch = "wasm32"))]
    pub fn with_model_load_stack<R>(f: impl FnOnce() -> R) -> R {
        // Loading a ViT-L record recurses deeply through Module::load_record; 1MB
        // thread stacks overflow.
        const STACK_SIZE: usize = 32 * 1024 * 1024;
        const RED_ZONE: usize = 2 * 1024 * 1024;
        maybe_grow(RED_ZONE, STACK_SIZE, f)
    }

    #[cfg(target_arch = "wasm32")]
    pub fn with_model_load_stack<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}

pub use stack_guard::with_model_load_stack;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load {component} checkpoint `{path}`: {message}")]
    Checkpoint {
        component: &'static str,
        path: PathBuf,
        message: String,
    },
    #[error("failed to save {component} checkpoint `{path}`: {message}")]
    Save {
        component: &'static str,
        path: PathBuf,
        message: String,
    },
}

#[derive(Config, Debug)]
pub struct DisambiguationModelConfig {
    /// Height every image is resized to before encoding.
    pub image_height: usize,
    /// Width every image is resized to before encoding.
    pub image_width: usize,
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    #[config(default = "DepthHeadConfig::new()")]
    pub depth_head: DepthHeadConfig,
    #[config(default = "DepthResample::Bilinear")]
    pub depth_resample: DepthResample,
    /// Optional trainable 1x1 projection of the backbone features ahead of masking.
    #[config(default = "None")]
    pub projection_channels: Option<usize>,
    #[config(default = 256)]
    pub hidden_size: usize,
}

impl DisambiguationModelConfig {
    /// Switches the backbone variant and resizes the depth head to match it; the depth
    /// activation is kept.
    pub fn with_variant(mut self, variant: BackboneVariant) -> Self {
        let activation = self.depth_head.activation.clone();
        self.depth_head = DepthHeadConfig::for_variant(&variant).with_activation(activation);
        self.backbone.variant = variant;
        self
    }

    /// Builds the model, sizing the classifier from a dry run of the backbone at the
    /// configured resolution.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DisambiguationModel<B> {
        let encoder = DepthGuidedEncoder::new(
            device,
            &self.backbone,
            &self.depth_head,
            self.depth_resample.clone(),
        );
        let [backbone_channels, grid_height, grid_width] =
            encoder.feature_shape(self.image_height, self.image_width, device);

        let projection = self.projection_channels.map(|channels| {
            Conv2dConfig::new([backbone_channels, channels], [1, 1])
                .with_bias(true)
                .init(device)
        });
        let channels = self.projection_channels.unwrap_or(backbone_channels);
        let feature_shape = [channels, grid_height, grid_width];
        let input_size = 2 * channels * grid_height * grid_width;
        info!(
            "feature map {channels}x{grid_height}x{grid_width}, classifier input width {input_size}"
        );

        let classifier = ClassifierHeadConfig::new(input_size)
            .with_hidden_size(self.hidden_size)
            .init(device);

        DisambiguationModel {
            encoder,
            projection,
            classifier,
            feature_shape: Ignored(feature_shape),
        }
    }
}

/// Depth-guided pair classifier.
///
/// Only `projection` and `classifier` are trainable; the encoder is frozen at construction.
#[derive(Module, Debug)]
pub struct DisambiguationModel<B: Backend> {
    encoder: DepthGuidedEncoder<B>,
    projection: Option<Conv2d<B>>,
    classifier: ClassifierHead<B>,
    feature_shape: Ignored<[usize; 3]>,
}

impl<B: Backend> DisambiguationModel<B> {
    pub fn encoder(&self) -> &DepthGuidedEncoder<B> {
        &self.encoder
    }

    /// `[C, gh, gw]` of the masked feature map of one image.
    pub fn feature_shape(&self) -> [usize; 3] {
        self.feature_shape.0
    }

    pub fn classifier_input_size(&self) -> usize {
        self.classifier.input_size()
    }

    pub fn load_pretrained(
        self,
        backbone: Option<&Path>,
        depth_head: Option<&Path>,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        if backbone.is_none() {
            warn!("no backbone checkpoint given; the frozen backbone keeps its random initialization");
        }
        if depth_head.is_none() {
            warn!("no depth head checkpoint given; the frozen depth head keeps its random initialization");
        }
        let encoder = self.encoder.load_weights(backbone, depth_head, device)?;
        Ok(Self { encoder, ..self })
    }

    /// Projects (when configured) and depth-masks one side of the pair.
    pub fn fuse(&self, encoded: EncodedImages<B>) -> Tensor<B, 4> {
        let features = match &self.projection {
            Some(projection) => projection.forward(encoded.features),
            None => encoded.features,
        };
        fusion::mask_features(features, encoded.depth)
    }

    /// Match logits `[N, 1]` for already encoded pairs.
    pub fn forward_encoded(&self, a: EncodedImages<B>, b: EncodedImages<B>) -> Tensor<B, 2> {
        let combined = fusion::flatten_pair(self.fuse(a), self.fuse(b));
        let width = combined.dims()[1];
        assert_eq!(
            width,
            self.classifier.input_size(),
            "concatenated features have width {width} but the classifier was built for {}; \
             images must be {:?} feature maps",
            self.classifier.input_size(),
            self.feature_shape.0
        );
        self.classifier.forward(combined)
    }

    /// Match logits `[N, 1]` for two `[N, 3, H, W]` image batches.
    pub fn forward(&self, images_a: Tensor<B, 4>, images_b: Tensor<B, 4>) -> Tensor<B, 2> {
        let a = self.encoder.encode(images_a);
        let b = self.encoder.encode(images_b);
        self.forward_encoded(a, b)
    }

    /// Probability in `[0, 1]` that each pair shows the same scene.
    pub fn classify(&self, images_a: Tensor<B, 4>, images_b: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images_a, images_b))
    }
}
