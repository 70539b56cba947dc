use std::{collections::HashSet, fs, path::Path};

use prost::Message;
use tracing::debug;
use trocr_int8_core::{TensorDim, TensorInfo};

use crate::{
    error::{OnnxError, Result},
    proto::{
        GraphProto, ModelProto, OperatorSetIdProto, ValueInfoProto, dimension, elem_type_name,
        type_proto,
    },
};

pub fn read_model(path: &Path) -> Result<ModelProto> {
    let model = candle_onnx::read_file(path).map_err(|source| OnnxError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(
        path = %path.display(),
        nodes = model.graph.as_ref().map_or(0, |g| g.node.len()),
        "onnx model read"
    );
    Ok(model)
}

pub fn write_model(model: &ModelProto, path: &Path) -> Result<()> {
    let bytes = model.encode_to_vec();
    fs::write(path, &bytes).map_err(|source| OnnxError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "onnx model written");
    Ok(())
}

pub fn graph(model: &ModelProto) -> Result<&GraphProto> {
    model.graph.as_ref().ok_or(OnnxError::MissingGraph)
}

pub fn graph_mut(model: &mut ModelProto) -> Result<&mut GraphProto> {
    model.graph.as_mut().ok_or(OnnxError::MissingGraph)
}

/// Declared graph inputs (initializers excluded) and outputs.
pub fn io_metadata(model: &ModelProto) -> Result<(Vec<TensorInfo>, Vec<TensorInfo>)> {
    let graph = graph(model)?;
    let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let inputs = graph
        .input
        .iter()
        .filter(|vi| !initializers.contains(vi.name.as_str()))
        .map(tensor_info)
        .collect();
    let outputs = graph.output.iter().map(tensor_info).collect();
    Ok((inputs, outputs))
}

pub fn tensor_info(value: &ValueInfoProto) -> TensorInfo {
    let tensor = match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => Some(tensor),
        _ => None,
    };
    let elem_type = tensor.map_or(0, |t| t.elem_type);
    let shape = tensor
        .and_then(|t| t.shape.as_ref())
        .map(|shape| {
            shape
                .dim
                .iter()
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(v)) if *v >= 0 => TensorDim::Fixed(*v as usize),
                    Some(dimension::Value::DimParam(p)) if !p.is_empty() => {
                        TensorDim::Symbolic(p.clone())
                    }
                    _ => TensorDim::Unknown,
                })
                .collect()
        })
        .unwrap_or_default();
    TensorInfo::new(value.name.clone(), shape, elem_type_name(elem_type))
}

/// Every tensor name a node, initializer or graph input makes available.
pub fn produced_names(graph: &GraphProto) -> HashSet<&str> {
    graph
        .node
        .iter()
        .flat_map(|n| n.output.iter())
        .chain(graph.initializer.iter().map(|t| &t.name))
        .chain(graph.input.iter().map(|vi| &vi.name))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Raise the default-domain opset to at least `min_version`.
pub fn ensure_opset(model: &mut ModelProto, min_version: i64) {
    match model
        .opset_import
        .iter_mut()
        .find(|op| op.domain.is_empty() || op.domain == "ai.onnx")
    {
        Some(op) if op.version < min_version => {
            debug!(from = op.version, to = min_version, "raising opset");
            op.version = min_version;
        }
        Some(_) => {}
        None => model.opset_import.push(OperatorSetIdProto {
            domain: String::new(),
            version: min_version,
        }),
    }
}
