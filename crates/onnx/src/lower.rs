//! Rewrites a QDQ-quantized graph into float ops candle can evaluate.
//!
//! Weight `DequantizeLinear` nodes are folded into float initializers.
//! Activation `QuantizeLinear` becomes a scale/shift/clip/truncate chain whose
//! output holds the integer code as a float, and activation
//! `DequantizeLinear` becomes `(x - zero_point) * scale`. Results match the
//! integer pipeline up to float rounding.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{
    error::{OnnxError, Result},
    model::graph_mut,
    proto::{
        DataType, ModelProto, NodeProto, TensorProto, float_tensor, get_int_attr, int_attr, node,
        quantized_range, read_f32, read_quantized, scalar_f32, tensor_dims,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoweringStats {
    pub folded_weights: usize,
    pub quantize_nodes: usize,
    pub dequantize_nodes: usize,
}

impl LoweringStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Whether the graph carries any QDQ node.
pub fn has_qdq(model: &ModelProto) -> bool {
    model.graph.as_ref().is_some_and(|g| {
        g.node
            .iter()
            .any(|n| n.op_type == "QuantizeLinear" || n.op_type == "DequantizeLinear")
    })
}

pub fn lower_qdq(model: &ModelProto) -> Result<(ModelProto, LoweringStats)> {
    let mut lowered = model.clone();
    let graph = graph_mut(&mut lowered)?;
    let initializers: HashMap<String, TensorProto> = graph
        .initializer
        .iter()
        .map(|t| (t.name.clone(), t.clone()))
        .collect();

    let mut stats = LoweringStats::default();
    let mut nodes = Vec::with_capacity(graph.node.len());
    let mut extra = Vec::new();

    for node in graph.node.drain(..) {
        match node.op_type.as_str() {
            "DequantizeLinear"
                if node
                    .input
                    .first()
                    .is_some_and(|name| initializers.contains_key(name)) =>
            {
                extra.push(fold_weight(&node, &initializers)?);
                stats.folded_weights += 1;
            }
            "DequantizeLinear" => {
                let (chain, consts) = lower_dequantize(&node, &initializers)?;
                nodes.extend(chain);
                extra.extend(consts);
                stats.dequantize_nodes += 1;
            }
            "QuantizeLinear" => {
                let (chain, consts) = lower_quantize(&node, &initializers)?;
                nodes.extend(chain);
                extra.extend(consts);
                stats.quantize_nodes += 1;
            }
            _ => nodes.push(node),
        }
    }
    graph.node = nodes;
    graph.initializer.extend(extra);

    // Drop initializers nothing consumes any more; candle loads every
    // initializer eagerly and has no int8 dtype.
    let used: HashSet<String> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().cloned())
        .chain(graph.output.iter().map(|o| o.name.clone()))
        .collect();
    let before = graph.initializer.len();
    graph.initializer.retain(|t| used.contains(&t.name));
    let kept: HashSet<String> = graph.initializer.iter().map(|t| t.name.clone()).collect();
    graph
        .input
        .retain(|vi| kept.contains(&vi.name) || !initializers.contains_key(&vi.name));

    debug!(
        folded = stats.folded_weights,
        quantize = stats.quantize_nodes,
        dequantize = stats.dequantize_nodes,
        dropped_initializers = before - graph.initializer.len(),
        "lowered QDQ graph"
    );
    Ok((lowered, stats))
}

fn node_label(node: &NodeProto) -> String {
    if node.name.is_empty() {
        node.output.first().cloned().unwrap_or_default()
    } else {
        node.name.clone()
    }
}

fn lowering_error(node: &NodeProto, reason: impl Into<String>) -> OnnxError {
    OnnxError::Lowering {
        node: node_label(node),
        reason: reason.into(),
    }
}

fn initializer<'a>(
    node: &NodeProto,
    initializers: &'a HashMap<String, TensorProto>,
    index: usize,
    role: &str,
) -> Result<Option<&'a TensorProto>> {
    match node.input.get(index).filter(|name| !name.is_empty()) {
        None => Ok(None),
        Some(name) => initializers
            .get(name)
            .map(Some)
            .ok_or_else(|| lowering_error(node, format!("{role} `{name}` is not an initializer"))),
    }
}

fn data_input(node: &NodeProto) -> Result<&str> {
    node.input
        .first()
        .map(String::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| lowering_error(node, "missing input"))
}

fn output_name(node: &NodeProto) -> Result<&str> {
    node.output
        .first()
        .map(String::as_str)
        .ok_or_else(|| lowering_error(node, "node has no output"))
}

/// Per-tensor scale and zero point of an activation Q/DQ pair.
struct ActivationParams {
    scale_name: String,
    zero_point: f32,
    qmin: f32,
    qmax: f32,
}

fn activation_params(
    node: &NodeProto,
    initializers: &HashMap<String, TensorProto>,
) -> Result<ActivationParams> {
    let scale = initializer(node, initializers, 1, "scale")?
        .ok_or_else(|| lowering_error(node, "missing scale input"))?;
    if read_f32(scale)?.len() != 1 {
        return Err(lowering_error(node, "only per-tensor activation scales are supported"));
    }
    let (zero_point, data_type) = match initializer(node, initializers, 2, "zero point")? {
        Some(zp) => {
            let values = read_quantized(zp)?;
            if values.len() != 1 {
                return Err(lowering_error(node, "only per-tensor activation zero points are supported"));
            }
            (values[0], zp.data_type)
        }
        None => (0, DataType::Uint8 as i32),
    };
    let (qmin, qmax) = quantized_range(data_type)?;
    Ok(ActivationParams {
        scale_name: scale.name.clone(),
        zero_point: zero_point as f32,
        qmin: qmin as f32,
        qmax: qmax as f32,
    })
}

/// `q = clip(x / scale + zp, qmin, qmax)`, rounded half up via truncation of a
/// non-negative shifted value.
fn lower_quantize(
    src: &NodeProto,
    initializers: &HashMap<String, TensorProto>,
) -> Result<(Vec<NodeProto>, Vec<TensorProto>)> {
    let data = data_input(src)?;
    let params = activation_params(src, initializers)?;
    let out = output_name(src)?;
    let t = |suffix: &str| format!("{out}__{suffix}");
    let (zp, qmin, qmax, shift) = (t("zp"), t("qmin"), t("qmax"), t("shift"));
    let (scaled, offset, clipped) = (t("scaled"), t("offset"), t("clipped"));
    let (shifted, truncated, widened) = (t("shifted"), t("truncated"), t("widened"));

    let consts = vec![
        scalar_f32(zp.as_str(), params.zero_point),
        scalar_f32(qmin.as_str(), params.qmin),
        scalar_f32(qmax.as_str(), params.qmax),
        scalar_f32(shift.as_str(), params.qmin - 0.5),
    ];
    let chain = vec![
        node(
            "Div",
            t("div"),
            &[data, params.scale_name.as_str()],
            &[scaled.as_str()],
            vec![],
        ),
        node("Add", t("add_zp"), &[scaled.as_str(), zp.as_str()], &[offset.as_str()], vec![]),
        node(
            "Clip",
            t("clip"),
            &[offset.as_str(), qmin.as_str(), qmax.as_str()],
            &[clipped.as_str()],
            vec![],
        ),
        node(
            "Sub",
            t("sub_shift"),
            &[clipped.as_str(), shift.as_str()],
            &[shifted.as_str()],
            vec![],
        ),
        node(
            "Cast",
            t("to_int"),
            &[shifted.as_str()],
            &[truncated.as_str()],
            vec![int_attr("to", DataType::Int64 as i64)],
        ),
        node(
            "Cast",
            t("to_float"),
            &[truncated.as_str()],
            &[widened.as_str()],
            vec![int_attr("to", DataType::Float as i64)],
        ),
        node("Add", t("add_qmin"), &[widened.as_str(), qmin.as_str()], &[out], vec![]),
    ];
    Ok((chain, consts))
}

/// `y = (q - zp) * scale` over a float tensor of integer codes.
fn lower_dequantize(
    src: &NodeProto,
    initializers: &HashMap<String, TensorProto>,
) -> Result<(Vec<NodeProto>, Vec<TensorProto>)> {
    let data = data_input(src)?;
    let params = activation_params(src, initializers)?;
    let out = output_name(src)?;
    let zp = format!("{out}__zp");
    let centered = format!("{out}__centered");
    let chain = vec![
        node(
            "Sub",
            format!("{out}__sub_zp"),
            &[data, zp.as_str()],
            &[centered.as_str()],
            vec![],
        ),
        node(
            "Mul",
            format!("{out}__mul_scale"),
            &[centered.as_str(), params.scale_name.as_str()],
            &[out],
            vec![],
        ),
    ];
    Ok((chain, vec![scalar_f32(zp, params.zero_point)]))
}

/// Dequantize a constant weight into a float initializer named like the
/// node's output.
fn fold_weight(
    node: &NodeProto,
    initializers: &HashMap<String, TensorProto>,
) -> Result<TensorProto> {
    let weight = initializer(node, initializers, 0, "weight")?
        .ok_or_else(|| lowering_error(node, "missing input"))?;
    let dims = tensor_dims(weight)?;
    let codes = read_quantized(weight)?;
    let scale_tensor = initializer(node, initializers, 1, "scale")?
        .ok_or_else(|| lowering_error(node, "missing scale input"))?;
    let scales = read_f32(scale_tensor)?;
    let zero_points = match initializer(node, initializers, 2, "zero point")? {
        Some(zp) => read_quantized(zp)?,
        None => vec![0; scales.len()],
    };
    if zero_points.len() != scales.len() {
        return Err(lowering_error(
            node,
            format!("{} scales but {} zero points", scales.len(), zero_points.len()),
        ));
    }

    let values = if scales.len() == 1 {
        codes
            .iter()
            .map(|&q| (q - zero_points[0]) as f32 * scales[0])
            .collect()
    } else {
        let rank = dims.len() as i64;
        let axis = get_int_attr(node, "axis").unwrap_or(1);
        let axis = if axis < 0 { axis + rank } else { axis };
        if !(0..rank).contains(&axis) {
            return Err(lowering_error(node, format!("axis {axis} out of range for rank {rank}")));
        }
        let axis = axis as usize;
        if dims[axis] != scales.len() {
            return Err(lowering_error(
                node,
                format!("{} scales for axis of size {}", scales.len(), dims[axis]),
            ));
        }
        let stride: usize = dims[axis + 1..].iter().product();
        codes
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                let c = (i / stride) % dims[axis];
                (q - zero_points[c]) as f32 * scales[c]
            })
            .collect()
    };
    Ok(float_tensor(output_name(node)?, &dims, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{GraphProto, quantized_tensor, tensor_value_info};

    fn qdq_model() -> ModelProto {
        let graph = GraphProto {
            name: "qdq".into(),
            input: vec![tensor_value_info("x", DataType::Float)],
            output: vec![tensor_value_info("y", DataType::Float)],
            initializer: vec![
                quantized_tensor("w_q", &[2, 2], DataType::Int8, &[10, -20, 30, -40]),
                float_tensor("w_scale", &[2], vec![0.5, 0.25]),
                quantized_tensor("w_zp", &[2], DataType::Int8, &[0, 0]),
                scalar_f32("x_scale", 0.1),
                quantized_tensor("x_zp", &[], DataType::Uint8, &[128]),
            ],
            node: vec![
                node(
                    "DequantizeLinear",
                    "w_dq",
                    &["w_q", "w_scale", "w_zp"],
                    &["w"],
                    vec![int_attr("axis", 1)],
                ),
                node("QuantizeLinear", "x_q", &["x", "x_scale", "x_zp"], &["x_quant"], vec![]),
                node(
                    "DequantizeLinear",
                    "x_dq",
                    &["x_quant", "x_scale", "x_zp"],
                    &["x_deq"],
                    vec![],
                ),
                node("MatMul", "mm", &["x_deq", "w"], &["y"], vec![]),
            ],
            ..Default::default()
        };
        ModelProto {
            graph: Some(graph),
            ..Default::default()
        }
    }

    #[test]
    fn weights_fold_per_column() -> Result<()> {
        let (lowered, stats) = lower_qdq(&qdq_model())?;
        assert_eq!(stats.folded_weights, 1);
        assert_eq!(stats.quantize_nodes, 1);
        assert_eq!(stats.dequantize_nodes, 1);
        let graph = lowered.graph.as_ref().ok_or(OnnxError::MissingGraph)?;
        let w = graph
            .initializer
            .iter()
            .find(|t| t.name == "w")
            .ok_or(OnnxError::UnknownOutput("w".into()))?;
        assert_eq!(read_f32(w)?, vec![5.0, -5.0, 15.0, -10.0]);
        Ok(())
    }

    #[test]
    fn integer_initializers_are_dropped() -> Result<()> {
        let (lowered, _) = lower_qdq(&qdq_model())?;
        let graph = lowered.graph.as_ref().ok_or(OnnxError::MissingGraph)?;
        assert!(graph.initializer.iter().all(|t| t.data_type == DataType::Float as i32));
        assert!(graph.node.iter().all(|n| !n.op_type.ends_with("QuantizeLinear")));
        assert!(!has_qdq(&lowered));
        assert!(has_qdq(&qdq_model()));
        Ok(())
    }

    #[test]
    fn qdq_node_without_inputs_is_a_lowering_error() {
        for index in [0, 1, 2] {
            let mut model = qdq_model();
            let graph = model.graph.as_mut().expect("graph");
            graph.node[index].input.clear();
            let label = graph.node[index].name.clone();
            assert!(
                matches!(
                    lower_qdq(&model),
                    Err(OnnxError::Lowering { ref node, .. }) if *node == label
                ),
                "node {label} must fail to lower"
            );
        }
    }

    #[test]
    fn per_channel_activation_scale_is_rejected() {
        let mut model = qdq_model();
        if let Some(graph) = model.graph.as_mut() {
            graph.initializer.push(float_tensor("bad_scale", &[2], vec![0.1, 0.2]));
            graph.node[1].input[1] = "bad_scale".into();
        }
        assert!(matches!(
            lower_qdq(&model),
            Err(OnnxError::Lowering { node, .. }) if node == "x_q"
        ));
    }
}
