use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use trocr_int8_onnx::proto::DataType;

/// Integer element type of a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    QInt8,
    QUInt8,
}

impl QuantType {
    pub fn data_type(self) -> DataType {
        match self {
            Self::QInt8 => DataType::Int8,
            Self::QUInt8 => DataType::Uint8,
        }
    }

    /// Integer range used when choosing scales.
    ///
    /// Symmetric int8 drops -128; `reduce_range` selects 7-bit ranges.
    pub fn range(self, symmetric: bool, reduce_range: bool) -> (i32, i32) {
        match (self, symmetric, reduce_range) {
            (Self::QInt8, true, false) => (-127, 127),
            (Self::QInt8, true, true) => (-64, 64),
            (Self::QInt8, false, false) => (-128, 127),
            (Self::QInt8, false, true) => (-64, 63),
            (Self::QUInt8, _, false) => (0, 255),
            (Self::QUInt8, _, true) => (0, 127),
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::QInt8 => "qint8",
            Self::QUInt8 => "quint8",
        })
    }
}

impl FromStr for QuantType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "qint8" | "int8" | "s8" => Ok(Self::QInt8),
            "quint8" | "uint8" | "u8" => Ok(Self::QUInt8),
            other => Err(anyhow!("unknown quantization type `{other}` (expected qint8 or quint8)")),
        }
    }
}

/// How quantized operators are represented in the output graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantFormat {
    /// QuantizeLinear/DequantizeLinear pairs around float operators.
    #[default]
    Qdq,
    /// Fused integer operators such as `QLinearMatMul`. Not produced.
    QOperator,
}

impl fmt::Display for QuantFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Qdq => "qdq",
            Self::QOperator => "qoperator",
        })
    }
}

impl FromStr for QuantFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "qdq" => Ok(Self::Qdq),
            "qoperator" | "operator" => Ok(Self::QOperator),
            other => Err(anyhow!("unknown quantization format `{other}` (expected qdq or qoperator)")),
        }
    }
}

/// Affine mapping `real = (q - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Scale and zero point covering `[rmin, rmax]`, widened to include zero.
    pub fn from_range(rmin: f32, rmax: f32, qmin: i32, qmax: i32, symmetric: bool) -> Self {
        let (mut rmin, mut rmax) = (rmin.min(0.0), rmax.max(0.0));
        if symmetric {
            let absmax = rmin.abs().max(rmax.abs());
            rmin = -absmax;
            rmax = absmax;
        }
        let scale = (rmax - rmin) / (qmax - qmin) as f32;
        if !scale.is_finite() || scale <= f32::EPSILON {
            return Self {
                scale: 1.0,
                zero_point: 0,
            };
        }
        let zero_point = if symmetric {
            ((qmax + qmin) as f32 / 2.0).round_ties_even() as i32
        } else {
            (qmin as f32 - rmin / scale).round_ties_even() as i32
        };
        Self {
            scale,
            zero_point: zero_point.clamp(qmin, qmax),
        }
    }

    pub fn quantize(&self, value: f32, qmin: i32, qmax: i32) -> i32 {
        ((value / self.scale).round_ties_even() as i32 + self.zero_point).clamp(qmin, qmax)
    }

    pub fn dequantize(&self, code: i32) -> f32 {
        (code - self.zero_point) as f32 * self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_int8_is_centred() {
        let (qmin, qmax) = QuantType::QInt8.range(true, false);
        let params = QuantParams::from_range(-0.5, 2.54, qmin, qmax, true);
        assert_eq!(params.zero_point, 0);
        assert!((params.scale - 2.54 / 127.0).abs() < 1e-7);
        assert_eq!(params.quantize(2.54, qmin, qmax), 127);
        assert_eq!(params.quantize(-10.0, qmin, qmax), -127);
    }

    #[test]
    fn asymmetric_range_always_contains_zero() {
        let params = QuantParams::from_range(1.0, 3.0, 0, 255, false);
        assert_eq!(params.zero_point, 0);
        assert!((params.dequantize(params.quantize(0.0, 0, 255))).abs() < 1e-6);

        let params = QuantParams::from_range(-1.0, 3.0, 0, 255, false);
        assert_eq!(params.zero_point, 64);
    }

    #[test]
    fn constant_zero_range_falls_back_to_unit_scale() {
        let params = QuantParams::from_range(0.0, 0.0, -127, 127, true);
        assert_eq!(params, QuantParams { scale: 1.0, zero_point: 0 });
    }

    #[test]
    fn reduced_ranges_keep_seven_bits() {
        assert_eq!(QuantType::QInt8.range(true, true), (-64, 64));
        assert_eq!(QuantType::QUInt8.range(false, true), (0, 127));
    }

    #[test]
    fn names_parse_case_insensitively() -> Result<()> {
        assert_eq!("QInt8".parse::<QuantType>()?, QuantType::QInt8);
        assert_eq!("uint8".parse::<QuantType>()?, QuantType::QUInt8);
        assert_eq!("QDQ".parse::<QuantFormat>()?, QuantFormat::Qdq);
        assert!("int4".parse::<QuantType>().is_err());
        Ok(())
    }
}
