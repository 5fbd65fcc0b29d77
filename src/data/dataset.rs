use std::path::Path;

use burn::prelude::*;
use image::RgbImage;

use super::{DatasetError, PairTable};
use crate::{
    inference::{ImageTransformConfig, NormalizedImage},
    loader::{ImageLoadError, load_image},
};

/// A decoded, transformed pair and its label.
#[derive(Clone, Debug)]
pub struct PairItem {
    pub image_a: NormalizedImage,
    pub image_b: NormalizedImage,
    pub label: f32,
}

impl PairItem {
    pub fn into_tensors<B: Backend>(
        self,
        device: &B::Device,
    ) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 1>) {
        (
            self.image_a.to_tensor(device),
            self.image_b.to_tensor(device),
            Tensor::from_floats([self.label], device),
        )
    }
}

/// Maps table rows to transformed image pairs. Images are decoded on every access.
#[derive(Clone, Debug)]
pub struct PairDataset {
    table: PairTable,
    transform: ImageTransformConfig,
}

impl PairDataset {
    pub fn new(table: PairTable, transform: ImageTransformConfig) -> Self {
        Self { table, transform }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn table(&self) -> &PairTable {
        &self.table
    }

    pub fn transform(&self) -> &ImageTransformConfig {
        &self.transform
    }

    /// Loads sample `index`.
    ///
    /// A missing image fails with [`DatasetError::MissingSample`] naming the sample
    /// and the offending path; nothing is substituted.
    pub fn get(&self, index: usize) -> Result<PairItem, DatasetError> {
        let record = self
            .table
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.table.len(),
            })?;

        let image_a = load_sample_image(index, &record.image_a)?;
        let image_b = load_sample_image(index, &record.image_b)?;

        Ok(PairItem {
            image_a: self.transform.apply(&image_a),
            image_b: self.transform.apply(&image_b),
            label: record.label,
        })
    }
}

fn load_sample_image(index: usize, path: &Path) -> Result<RgbImage, DatasetError> {
    load_image(path).map_err(|err| match err {
        ImageLoadError::NotFound { path } => DatasetError::MissingSample { index, path },
        source => DatasetError::Image { index, source },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PairRecord;
    use burn::backend::NdArray;
    use image::Rgb;
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(8, 6, Rgb(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn returns_transformed_pair_and_float_label() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", [255, 0, 0]);
        let b = write_image(dir.path(), "b.png", [0, 0, 255]);
        let table = PairTable::new(vec![PairRecord {
            image_a: a,
            image_b: b,
            label: 1.0,
        }]);
        let transform = ImageTransformConfig::new(4, 4)
            .with_mean([0.0; 3])
            .with_std([1.0; 3]);
        let dataset = PairDataset::new(table, transform);

        let item = dataset.get(0).unwrap();
        assert_eq!(item.label, 1.0);
        assert_eq!(item.image_a.data.len(), 3 * 4 * 4);
        assert!((item.image_a.data[0] - 1.0).abs() < 1e-6);
        assert!(item.image_b.data[0].abs() < 1e-6);

        let device = <TestBackend as Backend>::Device::default();
        let (a, b, label) = item.into_tensors::<TestBackend>(&device);
        assert_eq!(a.shape().dims(), [3, 4, 4]);
        assert_eq!(b.shape().dims(), [3, 4, 4]);
        assert_eq!(label.shape().dims(), [1]);
        assert_eq!(label.into_scalar(), 1.0);
    }

    #[test]
    fn differently_sized_sources_come_out_at_the_configured_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", [10, 20, 30]);
        let b = dir.path().join("b.png");
        RgbImage::from_pixel(3, 11, Rgb([40, 50, 60])).save(&b).unwrap();
        let table = PairTable::new(vec![PairRecord {
            image_a: a,
            image_b: b,
            label: 0.0,
        }]);
        let dataset = PairDataset::new(table, ImageTransformConfig::new(5, 7));

        let item = dataset.get(0).unwrap();
        assert_eq!((item.image_a.height, item.image_a.width), (5, 7));
        assert_eq!((item.image_b.height, item.image_b.width), (5, 7));
        assert_eq!(item.image_a.data.len(), item.image_b.data.len());
    }

    #[test]
    fn missing_file_fails_fast_with_index_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.png", [1, 2, 3]);
        let missing = dir.path().join("missing.png");
        let table = PairTable::new(vec![
            PairRecord {
                image_a: a.clone(),
                image_b: a.clone(),
                label: 1.0,
            },
            PairRecord {
                image_a: a,
                image_b: missing.clone(),
                label: 0.0,
            },
        ]);
        let dataset = PairDataset::new(table, ImageTransformConfig::new(4, 4));

        assert!(dataset.get(0).is_ok());
        match dataset.get(1) {
            Err(DatasetError::MissingSample { index, path }) => {
                assert_eq!(index, 1);
                assert_eq!(path, missing);
            }
            other => panic!("expected a missing sample error, got {other:?}"),
        }
        let message = dataset.get(1).unwrap_err().to_string();
        assert!(message.contains("missing.png"), "{message}");
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let dataset = PairDataset::new(PairTable::default(), ImageTransformConfig::new(4, 4));
        assert!(matches!(
            dataset.get(0),
            Err(DatasetError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }
}
