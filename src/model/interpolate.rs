use burn::{
    nn::interpolate::{Interpolate2dConfig, InterpolateMode},
    prelude::*,
};

/// How a depth map is brought onto the feature grid before masking.
#[derive(Config, Debug)]
pub enum DepthResample {
    Bilinear,
    Nearest,
}

impl Default for DepthResample {
    fn default() -> Self {
        DepthResample::Bilinear
    }
}

impl DepthResample {
    fn mode(&self) -> InterpolateMode {
        match self {
            DepthResample::Bilinear => InterpolateMode::Linear,
            DepthResample::Nearest => InterpolateMode::Nearest,
        }
    }
}

pub fn resize<B: Backend>(
    input: Tensor<B, 4>,
    output_size: [usize; 2],
    method: &DepthResample,
) -> Tensor<B, 4> {
    let [batch, channels, in_height, in_width] = input.dims();
    if [in_height, in_width] == output_size {
        return input;
    }

    // interpolation kernels read the raw buffer, so strided views are copied out first
    let contiguous = Tensor::<B, 4>::zeros([batch, channels, in_height, in_width], &input.device())
        .slice_assign([0..batch, 0..channels, 0..in_height, 0..in_width], input);

    Interpolate2dConfig::new()
        .with_output_size(Some(output_size))
        .with_mode(method.mode())
        .init()
        .forward(contiguous)
}

pub fn resize_bilinear<B: Backend>(input: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
    resize(input, output_size, &DepthResample::Bilinear)
}
