use trocr_int8_core::TensorDim;
use trocr_int8_onnx::proto::{
    DataType, GraphProto, ModelProto, OperatorSetIdProto, float_tensor, node, shaped_value_info,
};

pub const WEIGHTS: [f32; 12] = [
    0.5, -1.0, 0.25, //
    1.5, 0.75, -0.5, //
    -0.25, 2.0, 1.0, //
    0.1, -0.3, 0.6,
];
pub const BIAS: [f32; 3] = [0.1, -0.2, 0.3];

/// `y = x @ W + b` with `x: [batch, 4]`, plus the intermediate `mm_out`.
pub fn linear_model() -> ModelProto {
    let graph = GraphProto {
        name: "linear".into(),
        input: vec![shaped_value_info(
            "x",
            DataType::Float,
            &[TensorDim::Symbolic("batch".into()), TensorDim::Fixed(4)],
        )],
        output: vec![shaped_value_info(
            "y",
            DataType::Float,
            &[TensorDim::Symbolic("batch".into()), TensorDim::Fixed(3)],
        )],
        initializer: vec![
            float_tensor("W", &[4, 3], WEIGHTS.to_vec()),
            float_tensor("b", &[3], BIAS.to_vec()),
        ],
        node: vec![
            node("MatMul", "mm", &["x", "W"], &["mm_out"], vec![]),
            node("Add", "bias", &["mm_out", "b"], &["y"], vec![]),
        ],
        ..Default::default()
    };
    ModelProto {
        ir_version: 8,
        producer_name: "tests".into(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(graph),
        ..Default::default()
    }
}

pub fn reference(x: &[f32; 4]) -> Vec<f32> {
    (0..3)
        .map(|j| (0..4).map(|i| x[i] * WEIGHTS[i * 3 + j]).sum::<f32>() + BIAS[j])
        .collect()
}
