use std::{
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use trocr_int8_core::{
    DEFAULT_HUB_MODEL, DecodeOptions, HubModel, PreprocessConfig, SpecialTokenNames,
    TokenizerSource,
};
use trocr_int8_quant::{
    DEFAULT_OP_TYPES, DynamicQuantConfig, QuantFormat, QuantType, StaticQuantConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelPaths,
    pub tokenizer: TokenizerSettings,
    pub preprocess: PreprocessConfig,
    pub decode: DecodeOptions,
    pub quantization: QuantizationSettings,
    pub calibration: CalibrationSettings,
}

/// Float models and where their quantized copies are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub quantized_encoder: PathBuf,
    pub quantized_decoder: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        let dir = PathBuf::from("onnx").join("trocr-base-printed");
        Self {
            encoder: dir.join("encoder_model.onnx"),
            decoder: dir.join("decoder_model.onnx"),
            quantized_encoder: dir.join("encoder_model_int8.onnx"),
            quantized_decoder: dir.join("decoder_model_int8.onnx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerSettings {
    /// Local `tokenizer.json` or tokenizer directory; takes precedence over
    /// the hub model when set.
    pub path: Option<PathBuf>,
    pub hub_model: String,
    pub revision: Option<String>,
    pub special_tokens: SpecialTokenNames,
}

impl Default for TokenizerSettings {
    fn default() -> Self {
        Self {
            path: None,
            hub_model: DEFAULT_HUB_MODEL.to_string(),
            revision: None,
            special_tokens: SpecialTokenNames::default(),
        }
    }
}

impl TokenizerSettings {
    pub fn source(&self) -> TokenizerSource {
        match &self.path {
            Some(path) => TokenizerSource::Local(path.clone()),
            None => {
                let model = HubModel::new(self.hub_model.clone());
                TokenizerSource::Hub(match &self.revision {
                    Some(revision) => model.with_revision(revision.clone()),
                    None => model,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationSettings {
    pub format: QuantFormat,
    pub weight_type: QuantType,
    pub activation_type: QuantType,
    pub per_channel: bool,
    pub reduce_range: bool,
    pub op_types: Vec<String>,
    pub nodes_to_exclude: Vec<String>,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            format: QuantFormat::Qdq,
            weight_type: QuantType::QInt8,
            activation_type: QuantType::QInt8,
            per_channel: true,
            reduce_range: false,
            op_types: DEFAULT_OP_TYPES.iter().map(|s| s.to_string()).collect(),
            nodes_to_exclude: Vec::new(),
        }
    }
}

impl QuantizationSettings {
    pub fn dynamic_config(&self) -> DynamicQuantConfig {
        DynamicQuantConfig {
            weight_type: self.weight_type,
            per_channel: self.per_channel,
            reduce_range: self.reduce_range,
            op_types: self.op_types.clone(),
            nodes_to_exclude: self.nodes_to_exclude.clone(),
        }
    }

    pub fn static_config(&self) -> StaticQuantConfig {
        StaticQuantConfig {
            format: self.format,
            activation_type: self.activation_type,
            weight_type: self.weight_type,
            per_channel: self.per_channel,
            reduce_range: self.reduce_range,
            op_types: self.op_types.clone(),
            nodes_to_exclude: self.nodes_to_exclude.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub image_dir: PathBuf,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("calibration_images"),
        }
    }
}

impl AppConfig {
    /// Parse the TOML file at `path`, writing the defaults there first when it
    /// does not exist. Without a path the built-in defaults are returned.
    pub fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            let cfg = Self::default();
            cfg.save(path)?;
            info!(path = %path.display(), "wrote default configuration");
            return Ok(cfg);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration at {}", path.display()))
    }

    /// Defaults, then the configuration file, then `overrides`.
    pub fn load_with_overrides(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::load_or_init(overrides.config_path.as_deref())?;
        if let Some(path) = overrides.processor_config.as_deref() {
            config.preprocess = PreprocessConfig::from_processor_file(path)?;
        }
        config += overrides;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = toml::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write configuration to {}", path.display()))
    }
}

/// Command-line patch over [`AppConfig`]; `None` leaves a field untouched.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub decoder: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub hub_model: Option<String>,
    pub processor_config: Option<PathBuf>,
    pub image_size: Option<u32>,
    pub max_length: Option<usize>,
    pub calibration_dir: Option<PathBuf>,
    pub quantization: QuantizationOverride,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QuantizationOverride {
    pub format: Option<QuantFormat>,
    pub weight_type: Option<QuantType>,
    pub activation_type: Option<QuantType>,
    pub per_channel: Option<bool>,
    pub reduce_range: Option<bool>,
    pub op_types: Option<Vec<String>>,
    pub nodes_to_exclude: Option<Vec<String>>,
}

impl AddAssign<&QuantizationOverride> for QuantizationSettings {
    fn add_assign(&mut self, rhs: &QuantizationOverride) {
        if let Some(format) = rhs.format {
            self.format = format;
        }
        if let Some(weight_type) = rhs.weight_type {
            self.weight_type = weight_type;
        }
        if let Some(activation_type) = rhs.activation_type {
            self.activation_type = activation_type;
        }
        if let Some(per_channel) = rhs.per_channel {
            self.per_channel = per_channel;
        }
        if let Some(reduce_range) = rhs.reduce_range {
            self.reduce_range = reduce_range;
        }
        if let Some(op_types) = rhs.op_types.as_ref() {
            self.op_types = op_types.clone();
        }
        if let Some(nodes) = rhs.nodes_to_exclude.as_ref() {
            self.nodes_to_exclude = nodes.clone();
        }
    }
}

impl AddAssign<&ConfigOverrides> for AppConfig {
    fn add_assign(&mut self, rhs: &ConfigOverrides) {
        if let Some(path) = rhs.encoder.as_ref() {
            self.models.encoder = path.clone();
        }
        if let Some(path) = rhs.decoder.as_ref() {
            self.models.decoder = path.clone();
        }
        if let Some(path) = rhs.tokenizer.as_ref() {
            self.tokenizer.path = Some(path.clone());
        }
        if let Some(model) = rhs.hub_model.as_ref() {
            // An explicit hub id wins over a file-configured local path.
            self.tokenizer.hub_model = model.clone();
            if rhs.tokenizer.is_none() {
                self.tokenizer.path = None;
            }
        }
        if let Some(size) = rhs.image_size {
            self.preprocess.height = size;
            self.preprocess.width = size;
        }
        if let Some(max_length) = rhs.max_length {
            self.decode.max_length = max_length;
        }
        if let Some(dir) = rhs.calibration_dir.as_ref() {
            self.calibration.image_dir = dir.clone();
        }
        self.quantization += &rhs.quantization;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_trocr_base() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.decode.max_length, 64);
        assert_eq!(cfg.preprocess.height, 384);
        assert_eq!(cfg.tokenizer.hub_model, "microsoft/trocr-base-printed");
        assert_eq!(cfg.quantization.op_types, vec!["MatMul", "Gemm"]);
        assert!(matches!(cfg.tokenizer.source(), TokenizerSource::Hub(_)));
    }

    #[test]
    fn toml_round_trip_keeps_every_section() -> Result<()> {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg)?;
        let sections = [
            "[models]",
            "[tokenizer]",
            "[preprocess]",
            "[decode]",
            "[quantization]",
            "[calibration]",
        ];
        for section in sections {
            assert!(text.contains(section), "missing {section}");
        }
        let back: AppConfig = toml::from_str(&text)?;
        assert_eq!(back, cfg);
        Ok(())
    }
}
