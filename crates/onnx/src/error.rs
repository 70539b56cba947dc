use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while reading, rewriting or evaluating an ONNX graph.
#[derive(Debug, Error)]
pub enum OnnxError {
    #[error("failed to read ONNX model {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("failed to write ONNX model {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model has no graph")]
    MissingGraph,
    #[error("unsupported tensor element type {0}")]
    UnsupportedDataType(i32),
    #[error("tensor `{name}` malformed: {reason}")]
    MalformedTensor { name: String, reason: String },
    #[error("model declares no input named `{0}`")]
    UnknownInput(String),
    #[error("required input `{0}` was not provided")]
    MissingInput(String),
    #[error("model produces no tensor named `{0}`")]
    UnknownOutput(String),
    #[error("cannot lower `{node}`: {reason}")]
    Lowering { node: String, reason: String },
    #[error("evaluation failed: {0}")]
    Eval(#[from] candle_core::Error),
}

/// Result alias for ONNX operations.
pub type Result<T> = std::result::Result<T, OnnxError>;
