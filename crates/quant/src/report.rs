use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::params::{QuantFormat, QuantType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    Dynamic,
    Static,
}

/// Summary of one quantization run.
#[derive(Debug, Clone, Serialize)]
pub struct QuantReport {
    pub mode: QuantMode,
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: QuantFormat,
    pub weight_type: QuantType,
    pub activation_type: Option<QuantType>,
    pub quantized_weights: usize,
    pub quantized_activations: usize,
    pub calibration_batches: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl QuantReport {
    pub(crate) fn file_size(path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// Output size as a fraction of the input size.
    pub fn size_ratio(&self) -> Option<f64> {
        (self.input_bytes > 0).then(|| self.output_bytes as f64 / self.input_bytes as f64)
    }
}
