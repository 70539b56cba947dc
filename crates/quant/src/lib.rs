//! Post-training int8 quantization of ONNX graphs into the QDQ format.

pub mod calibrate;
pub mod dynamic;
pub mod params;
pub mod report;
pub mod select;
pub mod static_qdq;
pub mod weights;

use anyhow::{Result, bail, ensure};

pub use calibrate::{ActivationRange, Calibration, MinMaxCalibrator, calibrate};
pub use dynamic::{DynamicQuantConfig, quantize_dynamic};
pub use params::{QuantFormat, QuantParams, QuantType};
pub use report::{QuantMode, QuantReport};
pub use select::{DEFAULT_OP_TYPES, SUPPORTED_OP_TYPES, Target, find_targets};
pub use static_qdq::{StaticQuantConfig, quantize_static};
pub use weights::{QuantizedWeight, WeightOptions, insert_weight_qdq, quantize_weight};

/// Reject empty or unknown operator type lists before touching the model.
pub fn validate_op_types(op_types: &[String]) -> Result<()> {
    ensure!(!op_types.is_empty(), "at least one operator type must be quantized");
    for op in op_types {
        if !SUPPORTED_OP_TYPES.contains(&op.as_str()) {
            bail!(
                "operator type `{op}` cannot be quantized (supported: {})",
                SUPPORTED_OP_TYPES.join(", ")
            );
        }
    }
    Ok(())
}
