use std::path::Path;

use burn::prelude::*;
use image::{RgbImage, imageops::FilterType};

use crate::{
    loader::{ImageLoadError, load_image},
    model::DisambiguationModel,
};

/// Resize + per-channel normalization applied to every image before it reaches the backbone.
#[derive(Config, Debug)]
pub struct ImageTransformConfig {
    pub height: usize,
    pub width: usize,
    #[config(default = "[0.485, 0.456, 0.406]")]
    pub mean: [f32; 3],
    #[config(default = "[0.229, 0.224, 0.225]")]
    pub std: [f32; 3],
}

/// Channel-first (`CHW`) float pixels ready to be uploaded as a tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedImage {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl NormalizedImage {
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::<B, 1>::from_floats(self.data.as_slice(), device).reshape([
            3,
            self.height as i32,
            self.width as i32,
        ])
    }
}

impl ImageTransformConfig {
    /// Resizes `image` to the configured resolution and normalizes it.
    ///
    /// The same transform is applied to both images of a pair, each independently.
    pub fn apply(&self, image: &RgbImage) -> NormalizedImage {
        let (width, height) = (self.width as u32, self.height as u32);
        let resized;
        let source = if image.width() == width && image.height() == height {
            image
        } else {
            resized = image::imageops::resize(image, width, height, FilterType::Triangle);
            &resized
        };

        let data = normalize_rgb(source.as_raw(), self.width, self.height, self.mean, self.std)
            .expect("resized image always matches the configured resolution");

        NormalizedImage {
            data,
            height: self.height,
            width: self.width,
        }
    }
}

/// Converts packed RGB bytes into channel-first floats, `(x / 255 - mean) / std` per channel.
///
/// The input slice must contain `width * height * 3` bytes in row-major order.
pub fn normalize_rgb(
    rgb: &[u8],
    width: usize,
    height: usize,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<Vec<f32>, String> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or_else(|| "image dimensions overflowed while preparing input".to_string())?;

    if rgb.len() != expected_len {
        return Err(format!(
            "expected {expected_len} RGB bytes for {width}x{height}, got {}",
            rgb.len()
        ));
    }

    let hw = width * height;
    let mut data = vec![0.0f32; 3 * hw];

    for (idx, pixel) in rgb.chunks_exact(3).enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * hw + idx] = (value - mean[channel]) / std[channel];
        }
    }

    Ok(data)
}

/// Loads, transforms and classifies a single image pair, returning the match probability.
pub fn classify_paths<B: Backend>(
    model: &DisambiguationModel<B>,
    transform: &ImageTransformConfig,
    image_a: impl AsRef<Path>,
    image_b: impl AsRef<Path>,
    device: &B::Device,
) -> Result<f32, ImageLoadError> {
    let a = transform.apply(&load_image(image_a)?).to_tensor::<B>(device);
    let b = transform.apply(&load_image(image_b)?).to_tensor::<B>(device);

    let probability = model
        .classify(a.unsqueeze_dim(0), b.unsqueeze_dim(0))
        .into_scalar()
        .elem::<f32>();
    Ok(probability)
}
