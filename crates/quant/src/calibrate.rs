use std::collections::BTreeMap;

use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Tensor};
use tracing::{debug, info};
use trocr_int8_core::{CalibrationSource, ModelSession};
use trocr_int8_onnx::OnnxSession;

use crate::weights::min_max;

/// Observed value range of one activation tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationRange {
    pub min: f32,
    pub max: f32,
}

/// Running min/max over every batch seen for a fixed set of tensors.
#[derive(Debug, Clone)]
pub struct MinMaxCalibrator {
    tensors: Vec<String>,
    ranges: BTreeMap<String, ActivationRange>,
    batches: usize,
}

impl MinMaxCalibrator {
    pub fn new(tensors: Vec<String>) -> Self {
        Self {
            tensors,
            ranges: BTreeMap::new(),
            batches: 0,
        }
    }

    pub fn tensors(&self) -> &[String] {
        &self.tensors
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Fold one batch of outputs, given in the order of [`Self::tensors`].
    pub fn observe(&mut self, values: &[Tensor]) -> Result<()> {
        ensure!(
            values.len() == self.tensors.len(),
            "expected {} calibration tensors, got {}",
            self.tensors.len(),
            values.len()
        );
        for (name, value) in self.tensors.iter().zip(values) {
            let flat = value
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()
                .with_context(|| format!("failed to read activation `{name}`"))?;
            let (lo, hi) = min_max(flat.into_iter());
            self.ranges
                .entry(name.clone())
                .and_modify(|r| {
                    r.min = r.min.min(lo);
                    r.max = r.max.max(hi);
                })
                .or_insert(ActivationRange { min: lo, max: hi });
        }
        self.batches += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<BTreeMap<String, ActivationRange>> {
        if self.batches == 0 {
            bail!("calibration source yielded no batches; activation ranges are undefined");
        }
        Ok(self.ranges)
    }
}

/// Ranges collected by [`calibrate`].
#[derive(Debug, Clone)]
pub struct Calibration {
    pub ranges: BTreeMap<String, ActivationRange>,
    pub batches: usize,
}

/// Run every batch from `source` through `session`, recording the range of
/// each tensor in `tensors`.
pub fn calibrate(
    session: &OnnxSession,
    tensors: &[String],
    source: &mut impl CalibrationSource,
) -> Result<Calibration> {
    let augmented = session
        .with_extra_outputs(tensors)
        .context("failed to expose calibration tensors")?;
    let requested: Vec<&str> = tensors.iter().map(String::as_str).collect();
    let mut calibrator = MinMaxCalibrator::new(tensors.to_vec());
    info!(
        tensors = tensors.len(),
        expected_batches = ?source.len_hint(),
        "calibration started"
    );

    while let Some(batch) = source.next_batch()? {
        let origin = batch.source.clone();
        let values = augmented
            .run(Some(&requested), batch.into_bindings())
            .with_context(|| format!("calibration run failed for {}", origin.display()))?;
        calibrator.observe(&values)?;
        debug!(batch = calibrator.batches(), image = %origin.display(), "calibration batch");
    }

    let batches = calibrator.batches();
    let ranges = calibrator.finish()?;
    info!(batches, tensors = ranges.len(), "calibration finished");
    Ok(Calibration { ranges, batches })
}
