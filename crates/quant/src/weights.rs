use std::collections::HashSet;

use anyhow::{Context, Result, ensure};
use tracing::debug;
use trocr_int8_onnx::proto::{
    GraphProto, NodeProto, float_tensor, int_attr, node, quantized_tensor, read_f32, tensor_dims,
};

use crate::{
    params::{QuantParams, QuantType},
    select::Target,
};

/// Weight quantization knobs shared by dynamic and static modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightOptions {
    pub weight_type: QuantType,
    pub per_channel: bool,
    pub reduce_range: bool,
}

impl WeightOptions {
    /// Int8 weights are symmetric, uint8 weights asymmetric.
    pub fn symmetric(&self) -> bool {
        self.weight_type == QuantType::QInt8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    pub codes: Vec<i32>,
    /// One entry per channel, or a single entry for per-tensor scales.
    pub params: Vec<QuantParams>,
    pub axis: Option<usize>,
}

pub fn quantize_weight(
    values: &[f32],
    dims: &[usize],
    axis: Option<usize>,
    options: &WeightOptions,
) -> Result<QuantizedWeight> {
    ensure!(
        values.len() == dims.iter().product::<usize>(),
        "weight holds {} values but dims {dims:?}",
        values.len()
    );
    let (qmin, qmax) = options
        .weight_type
        .range(options.symmetric(), options.reduce_range);
    let symmetric = options.symmetric();

    let Some(axis) = axis else {
        let (rmin, rmax) = min_max(values.iter().copied());
        let params = QuantParams::from_range(rmin, rmax, qmin, qmax, symmetric);
        let codes = values.iter().map(|&v| params.quantize(v, qmin, qmax)).collect();
        return Ok(QuantizedWeight {
            codes,
            params: vec![params],
            axis: None,
        });
    };

    ensure!(axis < dims.len(), "channel axis {axis} out of range for dims {dims:?}");
    let channels = dims[axis];
    let stride: usize = dims[axis + 1..].iter().product();
    let channel_of = |index: usize| (index / stride) % channels;

    let mut ranges = vec![(0f32, 0f32); channels];
    for (index, &v) in values.iter().enumerate() {
        let range = &mut ranges[channel_of(index)];
        range.0 = range.0.min(v);
        range.1 = range.1.max(v);
    }
    let params: Vec<QuantParams> = ranges
        .into_iter()
        .map(|(rmin, rmax)| QuantParams::from_range(rmin, rmax, qmin, qmax, symmetric))
        .collect();
    let codes = values
        .iter()
        .enumerate()
        .map(|(index, &v)| params[channel_of(index)].quantize(v, qmin, qmax))
        .collect();
    Ok(QuantizedWeight {
        codes,
        params,
        axis: Some(axis),
    })
}

/// Range of `values` widened to include zero; NaNs are skipped.
pub(crate) fn min_max(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((0f32, 0f32), |(lo, hi), v| {
        if v.is_nan() { (lo, hi) } else { (lo.min(v), hi.max(v)) }
    })
}

/// Replace every target weight by an int8/uint8 initializer feeding a
/// `DequantizeLinear` node, and rewire consumers to its output.
///
/// Returns the number of distinct weights quantized.
pub fn insert_weight_qdq(
    graph: &mut GraphProto,
    targets: &[Target],
    options: &WeightOptions,
) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut dq_nodes: Vec<NodeProto> = Vec::new();

    for target in targets {
        if !seen.insert(target.weight.clone()) {
            continue;
        }
        let position = graph
            .initializer
            .iter()
            .position(|t| t.name == target.weight)
            .with_context(|| format!("weight `{}` is not an initializer", target.weight))?;
        let weight = graph.initializer.remove(position);
        let dims = tensor_dims(&weight)?;
        let values = read_f32(&weight)?;
        let axis = options.per_channel.then_some(target.channel_axis);
        let quantized = quantize_weight(&values, &dims, axis, options)
            .with_context(|| format!("failed to quantize weight `{}`", target.weight))?;

        let name = &target.weight;
        let (q_name, scale_name, zp_name, dq_name) = (
            format!("{name}_quantized"),
            format!("{name}_scale"),
            format!("{name}_zero_point"),
            format!("{name}_dequantized"),
        );
        let param_dims: Vec<usize> = match quantized.axis {
            Some(_) => vec![quantized.params.len()],
            None => Vec::new(),
        };
        let scales: Vec<f32> = quantized.params.iter().map(|p| p.scale).collect();
        let zero_points: Vec<i32> = quantized.params.iter().map(|p| p.zero_point).collect();
        let data_type = options.weight_type.data_type();
        graph.initializer.extend([
            quantized_tensor(q_name.as_str(), &dims, data_type, &quantized.codes),
            float_tensor(scale_name.as_str(), &param_dims, scales),
            quantized_tensor(zp_name.as_str(), &param_dims, data_type, &zero_points),
        ]);
        let attrs = match quantized.axis {
            Some(axis) => vec![int_attr("axis", axis as i64)],
            None => Vec::new(),
        };
        dq_nodes.push(node(
            "DequantizeLinear",
            format!("{name}_DequantizeLinear"),
            &[q_name.as_str(), scale_name.as_str(), zp_name.as_str()],
            &[dq_name.as_str()],
            attrs,
        ));
        for consumer in graph.node.iter_mut() {
            for input in consumer.input.iter_mut().filter(|input| input.as_str() == name.as_str()) {
                *input = dq_name.clone();
            }
        }
        debug!(
            weight = %name,
            dims = ?dims,
            channels = quantized.params.len(),
            "weight quantized"
        );
    }

    let count = dq_nodes.len();
    graph.node.splice(0..0, dq_nodes);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INT8: WeightOptions = WeightOptions {
        weight_type: QuantType::QInt8,
        per_channel: false,
        reduce_range: false,
    };

    #[test]
    fn per_tensor_int8_uses_absmax() -> Result<()> {
        let q = quantize_weight(&[0.5, -1.27, 1.0, 0.0], &[2, 2], None, &INT8)?;
        assert_eq!(q.params.len(), 1);
        assert_eq!(q.params[0].zero_point, 0);
        assert_eq!(q.codes, vec![50, -127, 100, 0]);
        Ok(())
    }

    #[test]
    fn per_channel_scales_follow_axis() -> Result<()> {
        // Columns of a [2, 2] MatMul weight: [0.5, 2] and [-2, 8].
        let q = quantize_weight(&[0.5, -2.0, 2.0, 8.0], &[2, 2], Some(1), &INT8)?;
        assert_eq!(q.params.len(), 2);
        assert!((q.params[0].scale - 2.0 / 127.0).abs() < 1e-7);
        assert!((q.params[1].scale - 8.0 / 127.0).abs() < 1e-7);
        assert_eq!(q.codes, vec![32, -32, 127, 127]);
        Ok(())
    }

    #[test]
    fn uint8_weights_are_asymmetric() -> Result<()> {
        let options = WeightOptions {
            weight_type: QuantType::QUInt8,
            reduce_range: true,
            ..INT8
        };
        let q = quantize_weight(&[-1.0, 3.0], &[1, 2], None, &options)?;
        assert_eq!(q.codes, vec![0, 127]);
        assert!(q.params[0].zero_point > 0);
        Ok(())
    }

    #[test]
    fn inserted_dequantize_feeds_every_consumer() -> Result<()> {
        let mut graph = GraphProto {
            initializer: vec![float_tensor("W", &[2, 2], vec![1.0, -1.0, 0.5, 0.25])],
            node: vec![
                node("MatMul", "a", &["x", "W"], &["y"], vec![]),
                node("MatMul", "b", &["y", "W"], &["z"], vec![]),
            ],
            ..Default::default()
        };
        let target = Target {
            node_index: 0,
            node_name: "a".into(),
            op_type: "MatMul".into(),
            activation: "x".into(),
            weight: "W".into(),
            channel_axis: 1,
        };
        let second = Target {
            node_index: 1,
            node_name: "b".into(),
            activation: "y".into(),
            ..target.clone()
        };
        let options = WeightOptions {
            per_channel: true,
            ..INT8
        };
        assert_eq!(insert_weight_qdq(&mut graph, &[target, second], &options)?, 1);
        assert_eq!(graph.node[0].op_type, "DequantizeLinear");
        assert_eq!(graph.node[0].attribute[0].i, 1);
        assert_eq!(graph.node[1].input[1], "W_dequantized");
        assert_eq!(graph.node[2].input[1], "W_dequantized");
        let names: Vec<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["W_quantized", "W_scale", "W_zero_point"]);
        Ok(())
    }
}
