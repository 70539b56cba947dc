use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trocr_int8_core::CalibrationSource;
use trocr_int8_onnx::{
    OnnxSession, ensure_opset, graph_mut,
    proto::{GraphProto, NodeProto, node, quantized_tensor, scalar_f32},
    read_model, write_model,
};

use crate::{
    calibrate::{ActivationRange, calibrate},
    params::{QuantFormat, QuantParams, QuantType},
    report::{QuantMode, QuantReport},
    select::{DEFAULT_OP_TYPES, Target, find_targets},
    validate_op_types,
    weights::{WeightOptions, insert_weight_qdq},
};

/// Calibrated weight + activation quantization options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticQuantConfig {
    pub format: QuantFormat,
    pub activation_type: QuantType,
    pub weight_type: QuantType,
    pub per_channel: bool,
    pub reduce_range: bool,
    pub op_types: Vec<String>,
    pub nodes_to_exclude: Vec<String>,
}

impl Default for StaticQuantConfig {
    fn default() -> Self {
        Self {
            format: QuantFormat::Qdq,
            activation_type: QuantType::QInt8,
            weight_type: QuantType::QInt8,
            per_channel: true,
            reduce_range: false,
            op_types: DEFAULT_OP_TYPES.iter().map(|s| s.to_string()).collect(),
            nodes_to_exclude: Vec::new(),
        }
    }
}

impl StaticQuantConfig {
    pub fn weight_options(&self) -> WeightOptions {
        WeightOptions {
            weight_type: self.weight_type,
            per_channel: self.per_channel,
            reduce_range: self.reduce_range,
        }
    }
}

/// Calibrate `input` over every batch of `source`, then write a QDQ model
/// with quantized weights and fake-quantized activations to `output`.
pub fn quantize_static(
    input: &Path,
    output: &Path,
    source: &mut impl CalibrationSource,
    config: &StaticQuantConfig,
) -> Result<QuantReport> {
    if config.format == QuantFormat::QOperator {
        bail!("QOperator format is not supported; use the QDQ format");
    }
    validate_op_types(&config.op_types)?;

    let mut model = read_model(input)?;
    let graph = graph_mut(&mut model)?;
    let targets = find_targets(graph, &config.op_types, &config.nodes_to_exclude);
    if targets.is_empty() {
        warn!(model = %input.display(), op_types = ?config.op_types, "no quantizable nodes found");
    }
    let activations = activation_names(&targets);

    let session = OnnxSession::from_model(model.clone())
        .with_context(|| format!("failed to prepare {} for calibration", input.display()))?;
    let calibration = calibrate(&session, &activations, source)
        .with_context(|| format!("calibration of {} failed", input.display()))?;

    let graph = graph_mut(&mut model)?;
    let quantized_activations = insert_activation_qdq(
        graph,
        &targets,
        &calibration.ranges,
        config.activation_type,
    )?;
    let quantized_weights = insert_weight_qdq(graph, &targets, &config.weight_options())
        .with_context(|| format!("failed to quantize weights of {}", input.display()))?;
    ensure_opset(&mut model, 13);
    write_model(&model, output)?;

    info!(
        input = %input.display(),
        output = %output.display(),
        weights = quantized_weights,
        activations = quantized_activations,
        batches = calibration.batches,
        "static quantization finished"
    );
    Ok(QuantReport {
        mode: QuantMode::Static,
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        format: config.format,
        weight_type: config.weight_type,
        activation_type: Some(config.activation_type),
        quantized_weights,
        quantized_activations,
        calibration_batches: calibration.batches,
        input_bytes: QuantReport::file_size(input),
        output_bytes: QuantReport::file_size(output),
    })
}

/// Distinct activation inputs of `targets`, in first-use order.
fn activation_names(targets: &[Target]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| seen.insert(t.activation.clone()))
        .map(|t| t.activation.clone())
        .collect()
}

/// Insert a QuantizeLinear/DequantizeLinear pair after the producer of each
/// calibrated activation and rewire the target nodes to the dequantized value.
fn insert_activation_qdq(
    graph: &mut GraphProto,
    targets: &[Target],
    ranges: &BTreeMap<String, ActivationRange>,
    activation_type: QuantType,
) -> Result<usize> {
    let (qmin, qmax) = activation_type.range(false, false);
    let mut pairs: HashMap<String, [NodeProto; 2]> = HashMap::new();

    for (name, range) in ranges {
        let params = QuantParams::from_range(range.min, range.max, qmin, qmax, false);
        let (scale, zero_point, quantized, dequantized) = (
            format!("{name}_scale"),
            format!("{name}_zero_point"),
            format!("{name}_quantized"),
            format!("{name}_dequantized"),
        );
        graph.initializer.extend([
            scalar_f32(scale.as_str(), params.scale),
            quantized_tensor(
                zero_point.as_str(),
                &[],
                activation_type.data_type(),
                &[params.zero_point],
            ),
        ]);
        let inputs = [name.as_str(), scale.as_str(), zero_point.as_str()];
        let q = node(
            "QuantizeLinear",
            format!("{name}_QuantizeLinear"),
            &inputs,
            &[quantized.as_str()],
            Vec::new(),
        );
        let dq = node(
            "DequantizeLinear",
            format!("{name}_DequantizeLinear"),
            &[quantized.as_str(), scale.as_str(), zero_point.as_str()],
            &[dequantized.as_str()],
            Vec::new(),
        );
        debug!(
            activation = %name,
            min = range.min,
            max = range.max,
            scale = params.scale,
            zero_point = params.zero_point,
            "activation quantized"
        );
        pairs.insert(name.clone(), [q, dq]);
    }

    let target_nodes: HashSet<usize> = targets.iter().map(|t| t.node_index).collect();
    let count = pairs.len();
    let mut nodes = Vec::with_capacity(graph.node.len() + 2 * count);
    // Graph inputs have no producer; their pairs go first.
    for input in &graph.input {
        if let Some(pair) = pairs.remove(&input.name) {
            nodes.extend(pair);
        }
    }
    for (index, mut current) in graph.node.drain(..).enumerate() {
        if target_nodes.contains(&index)
            && let Some(first) = current.input.first_mut()
            && ranges.contains_key(first.as_str())
        {
            *first = format!("{first}_dequantized");
        }
        let produced: Vec<[NodeProto; 2]> = current
            .output
            .iter()
            .filter_map(|out| pairs.remove(out))
            .collect();
        nodes.push(current);
        nodes.extend(produced.into_iter().flatten());
    }
    if let Some(orphan) = pairs.keys().next() {
        bail!("activation `{orphan}` has no producer in the graph");
    }
    graph.node = nodes;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trocr_int8_onnx::proto::float_tensor;

    /// `a = Relu(x)` feeding an unnamed MatMul and an unnamed Add.
    fn shared_activation_graph() -> GraphProto {
        GraphProto {
            initializer: vec![
                float_tensor("W", &[4, 3], vec![0.5; 12]),
                float_tensor("b", &[4], vec![1.0; 4]),
            ],
            node: vec![
                node("Relu", "", &["x"], &["a"], vec![]),
                node("MatMul", "", &["a", "W"], &["y"], vec![]),
                node("Add", "", &["a", "b"], &["z"], vec![]),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn only_target_nodes_read_the_dequantized_activation() -> Result<()> {
        let mut graph = shared_activation_graph();
        let targets = find_targets(&graph, &["MatMul".to_string()], &[]);
        assert_eq!(targets.len(), 1);
        let ranges = BTreeMap::from([("a".to_string(), ActivationRange { min: 0.0, max: 4.0 })]);

        let count = insert_activation_qdq(&mut graph, &targets, &ranges, QuantType::QInt8)?;
        assert_eq!(count, 1);
        let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(
            ops,
            vec!["Relu", "QuantizeLinear", "DequantizeLinear", "MatMul", "Add"]
        );
        assert_eq!(graph.node[3].input[0], "a_dequantized");
        assert_eq!(graph.node[4].input[0], "a");
        Ok(())
    }

    #[test]
    fn activation_names_are_unique_in_first_use_order() {
        let mut graph = shared_activation_graph();
        graph.node.push(node("MatMul", "", &["y", "W"], &["w"], vec![]));
        graph.node.push(node("MatMul", "", &["a", "W"], &["v"], vec![]));
        let targets = find_targets(&graph, &["MatMul".to_string()], &[]);
        assert_eq!(activation_names(&targets), vec!["a", "y"]);
    }
}
