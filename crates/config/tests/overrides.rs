use std::{fs, path::PathBuf};

use anyhow::Result;
use trocr_int8_config::{AppConfig, ConfigOverrides, QuantizationOverride};
use trocr_int8_core::TokenizerSource;
use trocr_int8_quant::{QuantFormat, QuantType};

#[test]
fn missing_config_file_is_initialised_with_defaults() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("nested").join("trocr.toml");
    let cfg = AppConfig::load_or_init(Some(&path))?;
    assert_eq!(cfg, AppConfig::default());
    assert!(path.exists());
    let reloaded = AppConfig::load_or_init(Some(&path))?;
    assert_eq!(reloaded, cfg);
    Ok(())
}

#[test]
fn no_config_path_uses_builtin_defaults() -> Result<()> {
    assert_eq!(AppConfig::load_or_init(None)?, AppConfig::default());
    Ok(())
}

#[test]
fn partial_file_keeps_defaults_for_absent_keys() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("trocr.toml");
    fs::write(
        &path,
        "[decode]\nmax_length = 32\n\n[quantization]\nweight_type = \"quint8\"\n",
    )?;
    let cfg = AppConfig::load_or_init(Some(&path))?;
    assert_eq!(cfg.decode.max_length, 32);
    assert_eq!(cfg.quantization.weight_type, QuantType::QUInt8);
    assert!(cfg.quantization.per_channel);
    assert_eq!(cfg.preprocess.width, 384);
    Ok(())
}

#[test]
fn malformed_file_reports_its_path() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("broken.toml");
    fs::write(&path, "[decode\nmax_length = ")?;
    let err = AppConfig::load_or_init(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("broken.toml"));
    Ok(())
}

#[test]
fn flags_override_file_values() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("trocr.toml");
    fs::write(
        &path,
        "[decode]\nmax_length = 32\n\n[tokenizer]\npath = \"tok\"\n\n[quantization]\nper_channel = false\n",
    )?;
    let overrides = ConfigOverrides {
        config_path: Some(path),
        max_length: Some(16),
        encoder: Some(PathBuf::from("enc.onnx")),
        image_size: Some(224),
        quantization: QuantizationOverride {
            per_channel: Some(true),
            format: Some(QuantFormat::QOperator),
            op_types: Some(vec!["Conv".to_string()]),
            ..Default::default()
        },
        ..Default::default()
    };
    let cfg = AppConfig::load_with_overrides(&overrides)?;
    assert_eq!(cfg.decode.max_length, 16);
    assert_eq!(cfg.models.encoder, PathBuf::from("enc.onnx"));
    assert_eq!((cfg.preprocess.height, cfg.preprocess.width), (224, 224));
    assert!(cfg.quantization.per_channel);
    assert_eq!(cfg.quantization.format, QuantFormat::QOperator);
    assert_eq!(cfg.quantization.static_config().op_types, vec!["Conv"]);
    assert_eq!(
        cfg.tokenizer.source(),
        TokenizerSource::Local(PathBuf::from("tok"))
    );
    Ok(())
}

#[test]
fn hub_flag_replaces_file_tokenizer_path() -> Result<()> {
    let mut cfg = AppConfig::default();
    cfg.tokenizer.path = Some(PathBuf::from("local"));
    cfg += &ConfigOverrides {
        hub_model: Some("microsoft/trocr-small-printed".to_string()),
        ..Default::default()
    };
    match cfg.tokenizer.source() {
        TokenizerSource::Hub(model) => assert_eq!(model.repo_id, "microsoft/trocr-small-printed"),
        other => panic!("expected hub source, got {other:?}"),
    }
    Ok(())
}
