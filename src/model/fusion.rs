use burn::prelude::*;

/// Weights every feature channel by the depth map: `features * depth`, broadcast over `C`.
///
/// `features` is `[N, C, H, W]`, `depth` is `[N, 1, H, W]`; the result keeps the feature shape.
pub fn mask_features<B: Backend>(features: Tensor<B, 4>, depth: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, _, height, width] = features.dims();
    let [depth_batch, depth_channels, depth_height, depth_width] = depth.dims();
    assert_eq!(
        (depth_batch, depth_channels),
        (batch, 1),
        "depth map must be [N, 1, H, W] with N = {batch}, got [{depth_batch}, {depth_channels}, ..]"
    );
    assert_eq!(
        [depth_height, depth_width],
        [height, width],
        "depth map must be resampled onto the {height}x{width} feature grid before masking"
    );

    let shape = features.shape();
    features * depth.expand(shape)
}

/// Flattens each map channel-major, then row-major, then column-major and concatenates
/// `a` before `b` along the feature axis.
pub fn flatten_pair<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 2> {
    let batch = a.dims()[0];
    let a = a.reshape([batch as i32, -1]);
    let b = b.reshape([batch as i32, -1]);
    Tensor::cat(vec![a, b], 1)
}
