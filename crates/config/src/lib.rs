pub mod args;
pub mod config;

pub use args::{
    ArgGroups, ConfigArgs, DecodeArgs, ModelArgs, QuantizationArgs, StaticQuantizationArgs,
    build_config_overrides,
};
pub use config::{
    AppConfig, CalibrationSettings, ConfigOverrides, ModelPaths, QuantizationOverride,
    QuantizationSettings, TokenizerSettings,
};
