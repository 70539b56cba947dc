use std::collections::{HashMap, HashSet};

use trocr_int8_onnx::proto::{DataType, GraphProto, NodeProto, TensorProto, get_int_attr};

pub const DEFAULT_OP_TYPES: &[&str] = &["MatMul", "Gemm"];

/// Operator types with a constant weight this crate knows how to quantize.
pub const SUPPORTED_OP_TYPES: &[&str] = &["MatMul", "Gemm", "Conv"];

/// One quantizable node: its float activation input and constant weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Position in `GraphProto::node`; node names are optional in ONNX.
    pub node_index: usize,
    pub node_name: String,
    pub op_type: String,
    pub activation: String,
    pub weight: String,
    /// Output-channel axis of the weight for per-channel scales.
    pub channel_axis: usize,
}

fn is_float_initializer(tensor: &TensorProto) -> bool {
    tensor.data_type == DataType::Float as i32 && tensor.dims.len() >= 2
}

fn channel_axis(node: &NodeProto, weight: &TensorProto) -> usize {
    match node.op_type.as_str() {
        "Conv" => 0,
        "Gemm" if get_int_attr(node, "transB").unwrap_or(0) != 0 => 0,
        "Gemm" => 1,
        _ => weight.dims.len().saturating_sub(1),
    }
}

/// Nodes of `op_types` whose second input is a float initializer.
///
/// Nodes listed in `exclude` (by name) are skipped. Unnamed nodes cannot be
/// excluded.
pub fn find_targets(graph: &GraphProto, op_types: &[String], exclude: &[String]) -> Vec<Target> {
    let wanted: HashSet<&str> = op_types.iter().map(String::as_str).collect();
    let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let initializers: HashMap<&str, &TensorProto> = graph
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    graph
        .node
        .iter()
        .enumerate()
        .filter(|(_, node)| wanted.contains(node.op_type.as_str()))
        .filter(|(_, node)| node.name.is_empty() || !excluded.contains(node.name.as_str()))
        .filter_map(|(node_index, node)| {
            let activation = node.input.first()?;
            let weight = initializers.get(node.input.get(1)?.as_str())?;
            if !is_float_initializer(weight) || initializers.contains_key(activation.as_str()) {
                return None;
            }
            Some(Target {
                node_index,
                node_name: node.name.clone(),
                op_type: node.op_type.clone(),
                activation: activation.clone(),
                weight: weight.name.clone(),
                channel_axis: channel_axis(node, weight),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trocr_int8_onnx::proto::{float_tensor, int_attr, node};

    fn graph() -> GraphProto {
        GraphProto {
            initializer: vec![
                float_tensor("W", &[4, 3], vec![0.0; 12]),
                float_tensor("G", &[3, 4], vec![0.0; 12]),
                float_tensor("bias", &[3], vec![0.0; 3]),
            ],
            node: vec![
                node("MatMul", "mm", &["x", "W"], &["h"], vec![]),
                node("Gemm", "gemm", &["h", "G", "bias"], &["y"], vec![int_attr("transB", 1)]),
                node("Add", "add", &["y", "bias"], &["z"], vec![]),
                node("MatMul", "act_mm", &["z", "z"], &["out"], vec![]),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn finds_weighted_nodes_with_axes() {
        let ops = vec!["MatMul".to_string(), "Gemm".to_string()];
        let targets = find_targets(&graph(), &ops, &[]);
        assert_eq!(targets.len(), 2);
        assert_eq!((targets[0].weight.as_str(), targets[0].channel_axis), ("W", 1));
        assert_eq!((targets[1].weight.as_str(), targets[1].channel_axis), ("G", 0));
        assert_eq!(targets[1].activation, "h");
        assert_eq!((targets[0].node_index, targets[1].node_index), (0, 1));
    }

    #[test]
    fn unnamed_nodes_are_found_by_position_and_never_excluded() {
        let mut graph = graph();
        for node in &mut graph.node {
            node.name.clear();
        }
        let ops = vec!["MatMul".to_string(), "Gemm".to_string()];
        let targets = find_targets(&graph, &ops, &[String::new()]);
        let indices: Vec<usize> = targets.iter().map(|t| t.node_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn respects_op_types_and_exclusions() {
        let ops = vec!["MatMul".to_string(), "Gemm".to_string()];
        let targets = find_targets(&graph(), &ops, &["gemm".to_string()]);
        assert_eq!(targets.len(), 1);
        assert!(find_targets(&graph(), &["Conv".to_string()], &[]).is_empty());
    }
}
