use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    tensor::activation::{relu, sigmoid, softplus},
};

use crate::model::{backbone::BackboneVariant, interpolate::resize_bilinear};

const TOKEN_NORM_EPS: f32 = 1e-5;

#[derive(Config, Debug)]
pub enum DepthActivation {
    Linear,
    Exp,
    Relu,
    Sigmoid,
    Softplus,
}

#[derive(Config, Debug)]
pub struct DepthHeadConfig {
    #[config(default = 64)]
    pub features: usize,
    #[config(default = "[48, 96, 192, 384]")]
    pub out_channels: [usize; 4],
    #[config(default = "DepthActivation::Relu")]
    pub activation: DepthActivation,
}

impl DepthHeadConfig {
    /// DPT head widths paired with each DINOv2 backbone.
    pub fn for_variant(variant: &BackboneVariant) -> Self {
        match variant {
            BackboneVariant::Small => Self::new()
                .with_features(64)
                .with_out_channels([48, 96, 192, 384]),
            BackboneVariant::Base => Self::new()
                .with_features(128)
                .with_out_channels([96, 192, 384, 768]),
            BackboneVariant::Large => Self::new()
                .with_features(256)
                .with_out_channels([256, 512, 1024, 1024]),
        }
    }

    /// Builds a head reading `dim_in`-wide backbone tokens.
    pub fn init<B: Backend>(&self, device: &B::Device, dim_in: usize) -> DepthHead<B> {
        DepthHead::new(device, self, dim_in)
    }
}

/// DPT depth head: reassembles four backbone stages into a feature pyramid, fuses it
/// top-down with refine-net blocks and predicts one depth channel at input resolution.
#[derive(Module, Debug)]
pub struct DepthHead<B: Backend> {
    projects: Vec<Conv2d<B>>,
    resize_layers: Vec<StageResample<B>>,
    scratch: RefineNeck<B>,
    activation: Ignored<DepthActivation>,
    token_dim: Ignored<usize>,
}

impl<B: Backend> DepthHead<B> {
    pub fn new(device: &B::Device, config: &DepthHeadConfig, dim_in: usize) -> Self {
        let projects = config
            .out_channels
            .iter()
            .map(|&channels| {
                Conv2dConfig::new([dim_in, channels], [1, 1])
                    .with_bias(true)
                    .init(device)
            })
            .collect();

        let resize_layers = vec![
            StageResample::conv_transpose(
                ConvTranspose2dConfig::new(
                    [config.out_channels[0], config.out_channels[0]],
                    [4, 4],
                )
                .with_stride([4, 4])
                .with_bias(true)
                .init(device),
            ),
            StageResample::conv_transpose(
                ConvTranspose2dConfig::new(
                    [config.out_channels[1], config.out_channels[1]],
                    [2, 2],
                )
                .with_stride([2, 2])
                .with_bias(true)
                .init(device),
            ),
            StageResample::identity(),
            StageResample::conv(
                Conv2dConfig::new([config.out_channels[3], config.out_channels[3]], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_stride([2, 2])
                    .with_bias(true)
                    .init(device),
            ),
        ];

        Self {
            projects,
            resize_layers,
            scratch: RefineNeck::new(device, &config.out_channels, config.features),
            activation: Ignored(config.activation.clone()),
            token_dim: Ignored(dim_in),
        }
    }

    /// Predicts `[N, 1, gh * p, gw * p]` depth from the hooked backbone tokens.
    pub fn forward(
        &self,
        hooks: &[Tensor<B, 3>],
        grid: [usize; 2],
        patch_size: usize,
    ) -> Tensor<B, 4> {
        assert!(
            hooks.len() >= 4,
            "DepthHead expects at least 4 hook tensors, got {}",
            hooks.len()
        );

        let stages = hooks
            .iter()
            .take(4)
            .enumerate()
            .map(|(stage, tokens)| self.prepare_stage(tokens.clone(), stage, grid))
            .collect::<Vec<_>>();

        let fused = self.fuse(stages);
        let fused = self.scratch.output_conv1.forward(fused);
        let fused = resize_bilinear(fused, [grid[0] * patch_size, grid[1] * patch_size]);
        let logits = self.scratch.output_conv2.forward(fused);
        self.apply_activation(logits)
    }

    fn prepare_stage(&self, tokens: Tensor<B, 3>, stage: usize, grid: [usize; 2]) -> Tensor<B, 4> {
        let [batch, token_count, channels] = tokens.dims();
        let patch_tokens = grid[0] * grid[1];
        assert!(
            token_count >= patch_tokens,
            "Hook tensor for stage {stage} does not have enough patch tokens"
        );
        assert_eq!(
            channels, self.token_dim.0,
            "Hook tensor for stage {stage} has {channels} channels, head expects {}",
            self.token_dim.0
        );

        let x = tokens.slice([0..batch, token_count - patch_tokens..token_count, 0..channels]);
        let x = normalize_tokens(x)
            .permute([0, 2, 1])
            .reshape([batch as i32, channels as i32, grid[0] as i32, grid[1] as i32]);
        let x = self.projects[stage].forward(x);
        self.resize_layers[stage].forward(x)
    }

    fn fuse(&self, stages: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let mut it = stages.into_iter();
        let (Some(l1), Some(l2), Some(l3), Some(l4)) = (it.next(), it.next(), it.next(), it.next())
        else {
            unreachable!("forward always prepares four stages");
        };

        let l1_rn = self.scratch.layer1_rn.forward(l1);
        let l2_rn = self.scratch.layer2_rn.forward(l2);
        let l3_rn = self.scratch.layer3_rn.forward(l3);
        let l4_rn = self.scratch.layer4_rn.forward(l4);

        let mut out = self
            .scratch
            .refinenet4
            .forward(l4_rn, None, Some(hw(&l3_rn)));
        out = self
            .scratch
            .refinenet3
            .forward(out, Some(l3_rn), Some(hw(&l2_rn)));
        out = self
            .scratch
            .refinenet2
            .forward(out, Some(l2_rn), Some(hw(&l1_rn)));
        self.scratch.refinenet1.forward(out, Some(l1_rn), None)
    }

    fn apply_activation(&self, tensor: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.activation.0 {
            DepthActivation::Linear => tensor,
            DepthActivation::Exp => tensor.exp(),
            DepthActivation::Relu => relu(tensor),
            DepthActivation::Sigmoid => sigmoid(tensor),
            DepthActivation::Softplus => softplus(tensor, 1.0),
        }
    }
}

fn hw<B: Backend>(tensor: &Tensor<B, 4>) -> [usize; 2] {
    let [_, _, height, width] = tensor.dims();
    [height, width]
}

/// Affine-free layer norm over the channel axis of `[N, T, C]` tokens.
fn normalize_tokens<B: Backend>(tokens: Tensor<B, 3>) -> Tensor<B, 3> {
    let (var, mean) = tokens.clone().var_mean_bias(2);
    tokens.sub(mean).div(var.add_scalar(TOKEN_NORM_EPS).sqrt())
}

#[derive(Module, Debug)]
struct StageResample<B: Backend> {
    conv_t: Option<ConvTranspose2d<B>>,
    conv: Option<Conv2d<B>>,
}

impl<B: Backend> StageResample<B> {
    fn identity() -> Self {
        Self {
            conv_t: None,
            conv: None,
        }
    }

    fn conv_transpose(layer: ConvTranspose2d<B>) -> Self {
        Self {
            conv_t: Some(layer),
            conv: None,
        }
    }

    fn conv(layer: Conv2d<B>) -> Self {
        Self {
            conv_t: None,
            conv: Some(layer),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(layer) = &self.conv_t {
            layer.forward(x)
        } else if let Some(layer) = &self.conv {
            layer.forward(x)
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
struct RefineNeck<B: Backend> {
    layer1_rn: Conv2d<B>,
    layer2_rn: Conv2d<B>,
    layer3_rn: Conv2d<B>,
    layer4_rn: Conv2d<B>,
    refinenet1: FusionBlock<B>,
    refinenet2: FusionBlock<B>,
    refinenet3: FusionBlock<B>,
    refinenet4: FusionBlock<B>,
    output_conv1: Conv2d<B>,
    output_conv2: DepthOutput<B>,
}

impl<B: Backend> RefineNeck<B> {
    fn new(device: &B::Device, in_channels: &[usize; 4], features: usize) -> Self {
        Self {
            layer1_rn: conv3x3(device, in_channels[0], features),
            layer2_rn: conv3x3(device, in_channels[1], features),
            layer3_rn: conv3x3(device, in_channels[2], features),
            layer4_rn: conv3x3(device, in_channels[3], features),
            refinenet1: FusionBlock::new(device, features, true),
            refinenet2: FusionBlock::new(device, features, true),
            refinenet3: FusionBlock::new(device, features, true),
            refinenet4: FusionBlock::new(device, features, false),
            output_conv1: Conv2dConfig::new([features, (features / 2).max(1)], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device),
            output_conv2: DepthOutput::new(device, (features / 2).max(1), 1, 32),
        }
    }
}

#[derive(Module, Debug)]
struct FusionBlock<B: Backend> {
    residual1: Option<ResidualUnit<B>>,
    residual2: ResidualUnit<B>,
    out_conv: Conv2d<B>,
}

impl<B: Backend> FusionBlock<B> {
    fn new(device: &B::Device, channels: usize, has_residual: bool) -> Self {
        Self {
            residual1: has_residual.then(|| ResidualUnit::new(device, channels)),
            residual2: ResidualUnit::new(device, channels),
            out_conv: Conv2dConfig::new([channels, channels], [1, 1])
                .with_bias(true)
                .init(device),
        }
    }

    fn forward(
        &self,
        top: Tensor<B, 4>,
        lateral: Option<Tensor<B, 4>>,
        size: Option<[usize; 2]>,
    ) -> Tensor<B, 4> {
        let mut y = top;
        if let (Some(residual), Some(lat)) = (&self.residual1, lateral) {
            y = y + residual.forward(lat);
        }

        y = self.residual2.forward(y);
        let current = hw(&y);
        let target = size.unwrap_or([current[0] * 2, current[1] * 2]);
        y = resize_bilinear(y, target);
        self.out_conv.forward(y)
    }
}

#[derive(Module, Debug)]
struct ResidualUnit<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> ResidualUnit<B> {
    fn new(device: &B::Device, channels: usize) -> Self {
        let conv = |in_ch, out_ch| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device)
        };

        Self {
            conv1: conv(channels, channels),
            conv2: conv(channels, channels),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(relu(input.clone()));
        let x = self.conv2.forward(relu(x));
        x + input
    }
}

#[derive(Module, Debug)]
struct DepthOutput<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> DepthOutput<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        mid_channels: usize,
    ) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, mid_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(true)
            .init(device);
        let conv2 = Conv2dConfig::new([mid_channels, out_channels], [1, 1])
            .with_bias(true)
            .init(device);
        Self { conv1, conv2 }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(input));
        self.conv2.forward(x)
    }
}

fn conv3x3<B: Backend>(device: &B::Device, in_channels: usize, out_channels: usize) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn hooks(device: &<TestBackend as Backend>::Device, tokens: usize) -> Vec<Tensor<TestBackend, 3>> {
        (0..4)
            .map(|stage| {
                Tensor::<TestBackend, 3>::random(
                    [2, tokens, 16],
                    burn::tensor::Distribution::Normal(stage as f64, 1.0),
                    device,
                )
            })
            .collect()
    }

    fn small_head(
        device: &<TestBackend as Backend>::Device,
        activation: DepthActivation,
    ) -> DepthHead<TestBackend> {
        DepthHeadConfig::new()
            .with_features(8)
            .with_out_channels([4, 4, 8, 8])
            .with_activation(activation)
            .init(device, 16)
    }

    #[test]
    fn predicts_single_channel_at_padded_resolution() {
        let device = <TestBackend as Backend>::Device::default();
        let head = small_head(&device, DepthActivation::Relu);

        // class token + 2x3 grid
        let depth = head.forward(&hooks(&device, 7), [2, 3], 14);
        assert_eq!(depth.dims(), [2, 1, 28, 42]);
        let values = depth.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn sigmoid_activation_bounds_depth() {
        let device = <TestBackend as Backend>::Device::default();
        let head = small_head(&device, DepthActivation::Sigmoid);

        let depth = head.forward(&hooks(&device, 4), [2, 2], 7);
        assert_eq!(depth.dims(), [2, 1, 14, 14]);
        let values = depth.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn variant_defaults_match_backbone_width() {
        assert_eq!(
            DepthHeadConfig::for_variant(&BackboneVariant::Small).out_channels,
            DepthHeadConfig::new().out_channels
        );
        let base = DepthHeadConfig::for_variant(&BackboneVariant::Base);
        assert_eq!(base.out_channels, [96, 192, 384, 768]);
        assert_eq!(base.features, 128);
        assert_eq!(
            DepthHeadConfig::for_variant(&BackboneVariant::Large).out_channels[3],
            1024
        );
    }

    #[test]
    #[should_panic(expected = "at least 4 hook tensors")]
    fn rejects_missing_stages() {
        let device = <TestBackend as Backend>::Device::default();
        let head = small_head(&device, DepthActivation::Relu);
        let mut stages = hooks(&device, 4);
        stages.truncate(3);
        head.forward(&stages, [2, 2], 14);
    }
}
