//! Pair tables, the paired-image dataset and the epoch loader that batches it.

mod batch;
mod dataset;

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::loader::ImageLoadError;

pub use batch::{EpochBatches, PairBatch, PairLoader, PairLoaderConfig};
pub use dataset::{PairDataset, PairItem};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to open pair table `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pair table row {row}: {source}")]
    Csv {
        row: usize,
        #[source]
        source: csv::Error,
    },
    #[error("pair table row {row} has label {value}, expected a value in [0, 1]")]
    InvalidLabel { row: usize, value: f32 },
    #[error("sample index {index} is out of range for a dataset of {len} pairs")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("missing sample {index}: image `{path}` does not exist")]
    MissingSample { index: usize, path: PathBuf },
    #[error("failed to load sample {index}: {source}")]
    Image {
        index: usize,
        #[source]
        source: ImageLoadError,
    },
}

/// One row of the pair table.
#[derive(Clone, Debug, PartialEq)]
pub struct PairRecord {
    pub image_a: PathBuf,
    pub image_b: PathBuf,
    pub label: f32,
}

#[derive(Debug, Deserialize)]
struct PairRow {
    #[serde(rename = "Image1")]
    image_a: PathBuf,
    #[serde(rename = "Image2")]
    image_b: PathBuf,
    #[serde(rename = "Label")]
    label: f32,
}

/// Immutable list of labelled image pairs, read once from a CSV with the header
/// `Image1,Image2,Label`.
#[derive(Clone, Debug, Default)]
pub struct PairTable {
    records: Vec<PairRecord>,
}

impl PairTable {
    pub fn new(records: Vec<PairRecord>) -> Self {
        Self { records }
    }

    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DatasetError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut records = Vec::new();

        for (row, result) in reader.deserialize::<PairRow>().enumerate() {
            let PairRow {
                image_a,
                image_b,
                label,
            } = result.map_err(|source| DatasetError::Csv { row, source })?;
            if !label.is_finite() || !(0.0..=1.0).contains(&label) {
                return Err(DatasetError::InvalidLabel { row, value: label });
            }
            records.push(PairRecord {
                image_a,
                image_b,
                label,
            });
        }

        Ok(Self { records })
    }

    /// Joins every relative image path onto `root`; absolute paths are kept.
    pub fn with_image_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        for record in &mut self.records {
            if record.image_a.is_relative() {
                record.image_a = root.join(&record.image_a);
            }
            if record.image_b.is_relative() {
                record.image_b = root.join(&record.image_b);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PairRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[PairRecord] {
        &self.records
    }
}
