use std::path::Path;

use burn::{
    module::{Ignored, Module},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::AutodiffBackend,
};
use tracing::info;

use crate::model::{
    ModelError,
    backbone::{BackboneConfig, DinoBackbone},
    depth::{DepthHead, DepthHeadConfig},
    interpolate::{DepthResample, resize},
    padding::pad_to_multiple,
    with_model_load_stack,
};

/// Backbone features and the depth map resampled onto the same grid.
#[derive(Clone, Debug)]
pub struct EncodedImages<B: Backend> {
    /// `[N, C, gh, gw]`
    pub features: Tensor<B, 4>,
    /// `[N, 1, gh, gw]`
    pub depth: Tensor<B, 4>,
}

impl<B: AutodiffBackend> EncodedImages<B> {
    pub fn from_inner(inner: EncodedImages<B::InnerBackend>) -> Self {
        Self {
            features: Tensor::from_inner(inner.features),
            depth: Tensor::from_inner(inner.depth),
        }
    }
}

/// The frozen half of the model: center padding, DINOv2 backbone and DPT depth head.
///
/// Padding is applied here, in front of the backbone, so the pretrained modules never
/// see an unaligned input.
#[derive(Module, Debug)]
pub struct DepthGuidedEncoder<B: Backend> {
    backbone: DinoBackbone<B>,
    depth_head: DepthHead<B>,
    resample: Ignored<DepthResample>,
}

impl<B: Backend> DepthGuidedEncoder<B> {
    pub fn new(
        device: &B::Device,
        backbone: &BackboneConfig,
        depth_head: &DepthHeadConfig,
        resample: DepthResample,
    ) -> Self {
        let backbone = backbone.init(device);
        let depth_head = depth_head.init(device, backbone.embed_dim());
        Self::from_parts(backbone, depth_head, resample)
    }

    /// Assembles an encoder from already built (for instance freshly imported) halves.
    pub fn from_parts(
        backbone: DinoBackbone<B>,
        depth_head: DepthHead<B>,
        resample: DepthResample,
    ) -> Self {
        Self {
            backbone,
            depth_head,
            resample: Ignored(resample),
        }
        .no_grad()
    }

    pub fn encode(&self, images: Tensor<B, 4>) -> EncodedImages<B> {
        let patch_size = self.backbone.patch_size();
        let padded = pad_to_multiple(images, patch_size);
        let output = self.backbone.forward(padded);

        let depth = self
            .depth_head
            .forward(&output.hooks, output.grid, patch_size);
        let depth = resize(depth, output.grid, &self.resample.0);

        EncodedImages {
            features: output.features.detach(),
            depth: depth.detach(),
        }
    }

    /// Runs the backbone once on a zero image and reports the `[C, gh, gw]` feature shape.
    pub fn feature_shape(&self, height: usize, width: usize, device: &B::Device) -> [usize; 3] {
        let blank = Tensor::<B, 4>::zeros([1, 3, height, width], device);
        let padded = pad_to_multiple(blank, self.backbone.patch_size());
        let [_, channels, grid_height, grid_width] = self.backbone.forward(padded).features.dims();
        [channels, grid_height, grid_width]
    }

    /// Loads pretrained weights for whichever halves have a checkpoint; the module is
    /// frozen again afterwards.
    pub fn load_weights(
        self,
        backbone: Option<&Path>,
        depth_head: Option<&Path>,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let Self {
            backbone: mut backbone_module,
            depth_head: mut depth_module,
            resample,
        } = self;

        if let Some(path) = backbone {
            info!("loading backbone weights from {}", path.display());
            let vit = backbone_module.vit().clone();
            let vit = with_model_load_stack(|| vit.load_file(path, &recorder, device)).map_err(
                |err| ModelError::Checkpoint {
                    component: "backbone",
                    path: path.to_path_buf(),
                    message: err.to_string(),
                },
            )?;
            backbone_module = backbone_module.with_vit(vit);
        }

        if let Some(path) = depth_head {
            info!("loading depth head weights from {}", path.display());
            depth_module = with_model_load_stack(|| depth_module.load_file(path, &recorder, device))
                .map_err(|err| ModelError::Checkpoint {
                    component: "depth head",
                    path: path.to_path_buf(),
                    message: err.to_string(),
                })?;
        }

        Ok(Self {
            backbone: backbone_module,
            depth_head: depth_module,
            resample,
        }
        .no_grad())
    }

    /// Writes the backbone ViT and the depth head as two records `load_weights` reads back.
    pub fn save_weights(&self, backbone: &Path, depth_head: &Path) -> Result<(), ModelError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.backbone
            .vit()
            .clone()
            .save_file(backbone, &recorder)
            .map_err(|err| ModelError::Save {
                component: "backbone",
                path: backbone.to_path_buf(),
                message: err.to_string(),
            })?;
        self.depth_head
            .clone()
            .save_file(depth_head, &recorder)
            .map_err(|err| ModelError::Save {
                component: "depth head",
                path: depth_head.to_path_buf(),
                message: err.to_string(),
            })?;
        info!(
            "saved encoder weights to {} and {}",
            backbone.display(),
            depth_head.display()
        );
        Ok(())
    }
}
