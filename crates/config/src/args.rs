use std::path::PathBuf;

use clap::Args;
use trocr_int8_quant::{QuantFormat, QuantType};

use crate::config::{ConfigOverrides, QuantizationOverride};

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Optional path to a TOML configuration file (created with defaults when missing).
    #[arg(long, value_name = "PATH", global = true, help_heading = "Application")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    /// Encoder ONNX model.
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub encoder: Option<PathBuf>,

    /// Decoder ONNX model.
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub decoder: Option<PathBuf>,

    /// Local tokenizer.json or tokenizer directory.
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub tokenizer: Option<PathBuf>,

    /// Hugging Face Hub model id to fetch the tokenizer from.
    #[arg(long, value_name = "ID", help_heading = "Model")]
    pub hub_model: Option<String>,

    /// Hugging Face preprocessor_config.json.
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub processor_config: Option<PathBuf>,

    /// Square input resolution fed to the encoder.
    #[arg(long, value_name = "PIXELS", help_heading = "Model")]
    pub image_size: Option<u32>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct QuantizationArgs {
    /// Weight element type (qint8/quint8).
    #[arg(long, value_name = "TYPE", help_heading = "Quantization")]
    pub weight_type: Option<QuantType>,

    /// Per-output-channel weight scales.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        help_heading = "Quantization"
    )]
    pub per_channel: Option<bool>,

    /// Use 7-bit weight ranges.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        help_heading = "Quantization"
    )]
    pub reduce_range: Option<bool>,

    /// Operator types to quantize, comma separated.
    #[arg(long, value_name = "OPS", value_delimiter = ',', help_heading = "Quantization")]
    pub op_types: Option<Vec<String>>,

    /// Node names left in float, comma separated.
    #[arg(long, value_name = "NODES", value_delimiter = ',', help_heading = "Quantization")]
    pub exclude_nodes: Option<Vec<String>>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct StaticQuantizationArgs {
    /// Activation element type (qint8/quint8).
    #[arg(long, value_name = "TYPE", help_heading = "Quantization")]
    pub activation_type: Option<QuantType>,

    /// Output graph format (qdq/qoperator).
    #[arg(long, value_name = "FORMAT", help_heading = "Quantization")]
    pub format: Option<QuantFormat>,

    /// Directory of calibration images.
    #[arg(long, value_name = "DIR", help_heading = "Calibration")]
    pub calibration_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DecodeArgs {
    /// Maximum number of decoder invocations per image.
    #[arg(long, value_name = "STEPS", help_heading = "Decoding")]
    pub max_length: Option<usize>,
}

impl From<&QuantizationArgs> for QuantizationOverride {
    fn from(value: &QuantizationArgs) -> Self {
        Self {
            weight_type: value.weight_type,
            per_channel: value.per_channel,
            reduce_range: value.reduce_range,
            op_types: value.op_types.clone(),
            nodes_to_exclude: value.exclude_nodes.clone(),
            ..Default::default()
        }
    }
}

/// Collect every flag group a subcommand accepts into one override patch.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArgGroups<'a> {
    pub model: Option<&'a ModelArgs>,
    pub quantization: Option<&'a QuantizationArgs>,
    pub static_quantization: Option<&'a StaticQuantizationArgs>,
    pub decode: Option<&'a DecodeArgs>,
}

pub fn build_config_overrides(config: &ConfigArgs, groups: ArgGroups<'_>) -> ConfigOverrides {
    let mut quantization: QuantizationOverride =
        groups.quantization.map(Into::into).unwrap_or_default();
    if let Some(args) = groups.static_quantization {
        quantization.activation_type = args.activation_type;
        quantization.format = args.format;
    }
    let model = groups.model;
    ConfigOverrides {
        config_path: config.config.clone(),
        encoder: model.and_then(|m| m.encoder.clone()),
        decoder: model.and_then(|m| m.decoder.clone()),
        tokenizer: model.and_then(|m| m.tokenizer.clone()),
        hub_model: model.and_then(|m| m.hub_model.clone()),
        processor_config: model.and_then(|m| m.processor_config.clone()),
        image_size: model.and_then(|m| m.image_size),
        max_length: groups.decode.and_then(|d| d.max_length),
        calibration_dir: groups
            .static_quantization
            .and_then(|s| s.calibration_dir.clone()),
        quantization,
    }
}
