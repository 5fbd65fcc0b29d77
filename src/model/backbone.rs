use burn::{
    module::{Ignored, Module},
    prelude::*,
};
use burn_dino::model::dino::{DinoVisionTransformer, DinoVisionTransformerConfig};

#[derive(Config, Debug)]
pub enum BackboneVariant {
    /// ViT-S/14, 384 channels.
    Small,
    /// ViT-B/14, 768 channels.
    Base,
    /// ViT-L/14, 1024 channels.
    Large,
}

impl BackboneVariant {
    pub fn embed_dim(&self) -> usize {
        match self {
            BackboneVariant::Small => 384,
            BackboneVariant::Base => 768,
            BackboneVariant::Large => 1024,
        }
    }

    /// Blocks whose tokens feed the depth head, matching the DINOv2 depth heads.
    pub fn hook_block_ids(&self) -> Vec<usize> {
        match self {
            BackboneVariant::Small | BackboneVariant::Base => vec![2, 5, 8, 11],
            BackboneVariant::Large => vec![4, 11, 17, 23],
        }
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = "BackboneVariant::Small")]
    pub variant: BackboneVariant,
    /// Resolution the position embeddings were trained at.
    #[config(default = 518)]
    pub image_size: usize,
    #[config(default = 14)]
    pub patch_size: usize,
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DinoBackbone<B> {
        DinoBackbone::new(device, self)
    }
}

/// Patch features reshaped onto the grid plus the raw tokens of the hooked blocks.
pub struct BackboneOutput<B: Backend> {
    pub features: Tensor<B, 4>,
    pub hooks: Vec<Tensor<B, 3>>,
    pub grid: [usize; 2],
}

/// Frozen DINOv2 feature extractor.
#[derive(Module, Debug)]
pub struct DinoBackbone<B: Backend> {
    pretrained: DinoVisionTransformer<B>,
    patch_size: Ignored<usize>,
    embed_dim: Ignored<usize>,
    hook_block_ids: Ignored<Vec<usize>>,
}

impl<B: Backend> DinoBackbone<B> {
    pub fn new(device: &B::Device, config: &BackboneConfig) -> Self {
        let image_size = Some(config.image_size);
        let patch_size = Some(config.patch_size);
        let mut vit_config = match config.variant {
            BackboneVariant::Small => DinoVisionTransformerConfig::vits(image_size, patch_size),
            BackboneVariant::Base => DinoVisionTransformerConfig::vitb(image_size, patch_size),
            BackboneVariant::Large => DinoVisionTransformerConfig::vitl(image_size, patch_size),
        };
        vit_config.register_token_count = 0;
        vit_config.use_register_tokens = false;
        vit_config.use_mask_token = false;
        vit_config.block_config.attn.quiet_softmax = false;

        Self {
            pretrained: vit_config.init(device),
            patch_size: Ignored(config.patch_size),
            embed_dim: Ignored(config.variant.embed_dim()),
            hook_block_ids: Ignored(config.variant.hook_block_ids()),
        }
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size.0
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim.0
    }

    pub fn vit(&self) -> &DinoVisionTransformer<B> {
        &self.pretrained
    }

    pub fn with_vit(self, pretrained: DinoVisionTransformer<B>) -> Self {
        Self { pretrained, ..self }
    }

    /// Encodes a patch-aligned `NCHW` batch into `[N, C, H / p, W / p]` features.
    pub fn forward(&self, input: Tensor<B, 4>) -> BackboneOutput<B> {
        let [_, _, height, width] = input.dims();
        let patch_size = self.patch_size.0;
        assert_eq!(
            height % patch_size,
            0,
            "Input height {height} must be divisible by patch size {patch_size}"
        );
        assert_eq!(
            width % patch_size,
            0,
            "Input width {width} must be divisible by patch size {patch_size}"
        );
        let grid = [height / patch_size, width / patch_size];

        let (output, hooks, _) = self.pretrained.forward_with_intermediate_tokens_ext(
            input,
            &self.hook_block_ids.0,
            &[],
            None,
        );
        assert!(
            hooks.len() >= self.hook_block_ids.0.len(),
            "Backbone returned fewer hooks ({}) than requested ({})",
            hooks.len(),
            self.hook_block_ids.0.len()
        );

        BackboneOutput {
            features: tokens_to_grid(output.x_norm_patchtokens, grid),
            hooks: hooks.into_iter().map(|hook| hook.patches).collect(),
            grid,
        }
    }
}

/// Keeps the trailing `gh * gw` tokens of `[N, T, C]` (dropping class/register tokens)
/// and lays them out as `[N, C, gh, gw]`.
pub fn tokens_to_grid<B: Backend>(tokens: Tensor<B, 3>, grid: [usize; 2]) -> Tensor<B, 4> {
    let [batch, token_count, channels] = tokens.dims();
    let patch_tokens = grid[0] * grid[1];
    assert!(
        token_count >= patch_tokens,
        "expected at least {patch_tokens} patch tokens for a {grid:?} grid, got {token_count}"
    );
    let start = token_count - patch_tokens;

    tokens
        .slice([0..batch, start..token_count, 0..channels])
        .permute([0, 2, 1])
        .reshape([batch as i32, channels as i32, grid[0] as i32, grid[1] as i32])
}
