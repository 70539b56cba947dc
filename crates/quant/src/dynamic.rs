use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trocr_int8_onnx::{ensure_opset, graph_mut, read_model, write_model};

use crate::{
    params::{QuantFormat, QuantType},
    report::{QuantMode, QuantReport},
    select::{DEFAULT_OP_TYPES, find_targets},
    validate_op_types,
    weights::{WeightOptions, insert_weight_qdq},
};

/// Weight-only quantization options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicQuantConfig {
    pub weight_type: QuantType,
    pub per_channel: bool,
    pub reduce_range: bool,
    pub op_types: Vec<String>,
    pub nodes_to_exclude: Vec<String>,
}

impl Default for DynamicQuantConfig {
    fn default() -> Self {
        Self {
            weight_type: QuantType::QInt8,
            per_channel: true,
            reduce_range: false,
            op_types: DEFAULT_OP_TYPES.iter().map(|s| s.to_string()).collect(),
            nodes_to_exclude: Vec::new(),
        }
    }
}

impl DynamicQuantConfig {
    pub fn weight_options(&self) -> WeightOptions {
        WeightOptions {
            weight_type: self.weight_type,
            per_channel: self.per_channel,
            reduce_range: self.reduce_range,
        }
    }
}

/// Quantize the constant weights of `input` and write a QDQ model to `output`.
///
/// Activations stay float; each weight is stored as int8/uint8 behind a
/// `DequantizeLinear` node.
pub fn quantize_dynamic(
    input: &Path,
    output: &Path,
    config: &DynamicQuantConfig,
) -> Result<QuantReport> {
    validate_op_types(&config.op_types)?;
    let mut model = read_model(input)?;
    let graph = graph_mut(&mut model)?;
    let targets = find_targets(graph, &config.op_types, &config.nodes_to_exclude);
    if targets.is_empty() {
        warn!(model = %input.display(), op_types = ?config.op_types, "no quantizable nodes found");
    }
    let quantized_weights = insert_weight_qdq(graph, &targets, &config.weight_options())
        .with_context(|| format!("failed to quantize weights of {}", input.display()))?;
    ensure_opset(&mut model, if config.per_channel { 13 } else { 10 });
    write_model(&model, output)?;

    let report = QuantReport {
        mode: QuantMode::Dynamic,
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        format: QuantFormat::Qdq,
        weight_type: config.weight_type,
        activation_type: None,
        quantized_weights,
        quantized_activations: 0,
        calibration_batches: 0,
        input_bytes: QuantReport::file_size(input),
        output_bytes: QuantReport::file_size(output),
    };
    info!(
        input = %input.display(),
        output = %output.display(),
        weights = quantized_weights,
        per_channel = config.per_channel,
        reduce_range = config.reduce_range,
        "dynamic quantization finished"
    );
    Ok(report)
}
