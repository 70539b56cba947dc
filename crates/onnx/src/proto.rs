//! Builders and readers for the protobuf types candle-onnx generates.

pub use candle_onnx::onnx::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeProto, TypeProto, ValueInfoProto,
    attribute_proto::AttributeType,
    tensor_proto::DataType,
    tensor_shape_proto::{Dimension, dimension},
    type_proto,
};

use trocr_int8_core::TensorDim;

use crate::error::{OnnxError, Result};

/// Element type rendered the way ONNX tooling prints it, e.g. `tensor(float)`.
pub fn elem_type_name(code: i32) -> String {
    match DataType::try_from(code) {
        Ok(DataType::Undefined) | Err(_) => "tensor(undefined)".to_string(),
        Ok(dt) => format!("tensor({})", dt.as_str_name().to_ascii_lowercase()),
    }
}

/// Integer range representable by a quantized element type.
pub fn quantized_range(code: i32) -> Result<(i32, i32)> {
    match DataType::try_from(code) {
        Ok(DataType::Int8) => Ok((i8::MIN as i32, i8::MAX as i32)),
        Ok(DataType::Uint8) => Ok((u8::MIN as i32, u8::MAX as i32)),
        _ => Err(OnnxError::UnsupportedDataType(code)),
    }
}

pub fn tensor_dims(tensor: &TensorProto) -> Result<Vec<usize>> {
    tensor
        .dims
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| OnnxError::MalformedTensor {
                name: tensor.name.clone(),
                reason: format!("negative dimension {d}"),
            })
        })
        .collect()
}

pub fn element_count(tensor: &TensorProto) -> Result<usize> {
    Ok(tensor_dims(tensor)?.iter().product())
}

/// Float32 initializer stored in `float_data`.
pub fn float_tensor(name: impl Into<String>, dims: &[usize], values: Vec<f32>) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.iter().map(|&d| d as i64).collect(),
        data_type: DataType::Float as i32,
        float_data: values,
        ..Default::default()
    }
}

/// Rank-0 float32 initializer.
pub fn scalar_f32(name: impl Into<String>, value: f32) -> TensorProto {
    float_tensor(name, &[], vec![value])
}

/// Int8 or uint8 initializer stored little-endian in `raw_data`.
///
/// `values` must already lie inside the range of `data_type`.
pub fn quantized_tensor(
    name: impl Into<String>,
    dims: &[usize],
    data_type: DataType,
    values: &[i32],
) -> TensorProto {
    let raw_data = match data_type {
        DataType::Int8 => values.iter().map(|&v| (v as i8) as u8).collect(),
        _ => values.iter().map(|&v| v as u8).collect(),
    };
    TensorProto {
        name: name.into(),
        dims: dims.iter().map(|&d| d as i64).collect(),
        data_type: data_type as i32,
        raw_data,
        ..Default::default()
    }
}

/// Float32 contents of an initializer, whichever field carries them.
pub fn read_f32(tensor: &TensorProto) -> Result<Vec<f32>> {
    if tensor.data_type != DataType::Float as i32 {
        return Err(OnnxError::UnsupportedDataType(tensor.data_type));
    }
    let expected = element_count(tensor)?;
    let values: Vec<f32> = if !tensor.raw_data.is_empty() {
        if tensor.raw_data.len() % 4 != 0 {
            return Err(OnnxError::MalformedTensor {
                name: tensor.name.clone(),
                reason: format!("raw_data length {} is not a multiple of 4", tensor.raw_data.len()),
            });
        }
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    } else {
        tensor.float_data.clone()
    };
    check_len(tensor, values.len(), expected)?;
    Ok(values)
}

/// Int8/uint8 contents widened to `i32`.
pub fn read_quantized(tensor: &TensorProto) -> Result<Vec<i32>> {
    let expected = element_count(tensor)?;
    let values: Vec<i32> = match DataType::try_from(tensor.data_type) {
        Ok(DataType::Int8) if !tensor.raw_data.is_empty() => {
            tensor.raw_data.iter().map(|&b| (b as i8) as i32).collect()
        }
        Ok(DataType::Uint8) if !tensor.raw_data.is_empty() => {
            tensor.raw_data.iter().map(|&b| b as i32).collect()
        }
        Ok(DataType::Int8 | DataType::Uint8) => tensor.int32_data.clone(),
        _ => return Err(OnnxError::UnsupportedDataType(tensor.data_type)),
    };
    check_len(tensor, values.len(), expected)?;
    Ok(values)
}

fn check_len(tensor: &TensorProto, found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(OnnxError::MalformedTensor {
            name: tensor.name.clone(),
            reason: format!("holds {found} elements, dims imply {expected}"),
        });
    }
    Ok(())
}

pub fn node(
    op_type: &str,
    name: impl Into<String>,
    inputs: &[&str],
    outputs: &[&str],
    attribute: Vec<AttributeProto>,
) -> NodeProto {
    NodeProto {
        op_type: op_type.to_string(),
        name: name.into(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        attribute,
        ..Default::default()
    }
}

pub fn int_attr(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

/// Integer attribute of `node`, if set.
pub fn get_int_attr(node: &NodeProto, name: &str) -> Option<i64> {
    node.attribute
        .iter()
        .find(|attr| attr.name == name)
        .map(|attr| attr.i)
}

/// Untyped-shape value info, enough for graph outputs added after the fact.
pub fn tensor_value_info(name: impl Into<String>, elem_type: DataType) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: None,
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Value info with a declared shape.
pub fn shaped_value_info(
    name: impl Into<String>,
    elem_type: DataType,
    dims: &[TensorDim],
) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| Dimension {
            value: match d {
                TensorDim::Fixed(v) => Some(dimension::Value::DimValue(*v as i64)),
                TensorDim::Symbolic(param) => Some(dimension::Value::DimParam(param.clone())),
                TensorDim::Unknown => None,
            },
            ..Default::default()
        })
        .collect();
    let mut info = tensor_value_info(name, elem_type);
    if let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
        ..
    }) = info.r#type.as_mut()
    {
        tensor.shape = Some(TensorShapeProto { dim });
    }
    info
}
