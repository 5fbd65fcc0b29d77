use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use image::{AnimationDecoder, DynamicImage, RgbImage, codecs::gif::GifDecoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("image `{path}` does not exist")]
    NotFound { path: PathBuf },
    #[error("failed to read image `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image `{path}`: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("animated image `{path}` contains no frames")]
    EmptyAnimation { path: PathBuf },
}

impl ImageLoadError {
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound { path }
            | Self::Io { path, .. }
            | Self::Decode { path, .. }
            | Self::EmptyAnimation { path } => path,
        }
    }
}

/// Decodes the image at `path` into packed 8-bit RGB.
///
/// Single-channel and gray+alpha sources are replicated across the three color
/// channels and alpha is dropped. GIF files go through the animation decoder:
/// the first frame is taken and its palette expanded to RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage, ImageLoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ImageLoadError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let image = if is_animated_format(path) {
        load_first_gif_frame(path)?
    } else {
        image::open(path).map_err(|source| ImageLoadError::Decode {
            path: path.to_path_buf(),
            source,
        })?
    };

    Ok(image.to_rgb8())
}

fn is_animated_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"))
}

fn load_first_gif_frame(path: &Path) -> Result<DynamicImage, ImageLoadError> {
    let file = File::open(path).map_err(|source| ImageLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let decode_err = |source| ImageLoadError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let decoder = GifDecoder::new(BufReader::new(file)).map_err(decode_err)?;
    let frame = decoder
        .into_frames()
        .next()
        .ok_or_else(|| ImageLoadError::EmptyAnimation {
            path: path.to_path_buf(),
        })?
        .map_err(decode_err)?;

    Ok(DynamicImage::ImageRgba8(frame.into_buffer()))
}
