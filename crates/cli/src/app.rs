use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::Serialize;
use tracing::info;
use trocr_int8_config::{AppConfig, ModelArgs};
use trocr_int8_core::{
    CalibrationFeeder, Preprocessor, Recognition, TensorInfo, TokenizerVocabulary,
    TrOcrPreprocessor, TrOcrRecognizer, Vocabulary, smoke_decoder, smoke_encoder,
};
use trocr_int8_onnx::{OnnxSession, io_metadata, read_model};
use trocr_int8_quant::{QuantReport, quantize_dynamic, quantize_static};

use crate::args::{
    Cli, CliCommand, DynamicArgs, InspectArgs, PreprocessArgs, QuantizeArgs, QuantizeCommand,
    RecognizeArgs, SmokeArgs, StaticArgs, VocabArgs,
};

pub fn run(cli: Cli) -> Result<()> {
    let overrides = cli.config_overrides();
    let config = AppConfig::load_with_overrides(&overrides)?;
    info!(
        "Using configuration {}",
        overrides
            .config_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<built-in defaults>".to_string())
    );

    match cli.command {
        CliCommand::Quantize(args) => run_quantize(args, &config),
        CliCommand::Recognize(args) => run_recognize(args, &config),
        CliCommand::Smoke(args) => run_smoke(args, &config),
        CliCommand::Inspect(args) => run_inspect(args),
        CliCommand::Vocab(args) => run_vocab(args, &config),
        CliCommand::Preprocess(args) => run_preprocess(args, &config),
    }
}

fn run_quantize(args: QuantizeArgs, config: &AppConfig) -> Result<()> {
    let report = match args.command {
        QuantizeCommand::Dynamic(cmd) => run_dynamic(cmd, config)?,
        QuantizeCommand::Static(cmd) => run_static(cmd, config)?,
    };
    if let Some(ratio) = report.size_ratio() {
        info!(
            "Wrote {} ({} -> {} bytes, {:.1}% of input)",
            report.output.display(),
            report.input_bytes,
            report.output_bytes,
            ratio * 100.0
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_dynamic(cmd: DynamicArgs, config: &AppConfig) -> Result<QuantReport> {
    let output = cmd.io.output_path();
    quantize_dynamic(&cmd.io.input, &output, &config.quantization.dynamic_config())
}

fn run_static(cmd: StaticArgs, config: &AppConfig) -> Result<QuantReport> {
    let output = cmd.io.output_path();
    let session = OnnxSession::load(&cmd.io.input)?;
    let preprocessor = TrOcrPreprocessor::new(config.preprocess.clone(), Device::Cpu)?;
    let mut feeder =
        CalibrationFeeder::new(&session, &config.calibration.image_dir, preprocessor)?;
    quantize_static(
        &cmd.io.input,
        &output,
        &mut feeder,
        &config.quantization.static_config(),
    )
}

/// Explicit model flags win; otherwise `--quantized` picks the int8 copies.
fn model_paths(config: &AppConfig, explicit: &ModelArgs, quantized: bool) -> (PathBuf, PathBuf) {
    let models = &config.models;
    let encoder = match (&explicit.encoder, quantized) {
        (None, true) => models.quantized_encoder.clone(),
        _ => models.encoder.clone(),
    };
    let decoder = match (&explicit.decoder, quantized) {
        (None, true) => models.quantized_decoder.clone(),
        _ => models.decoder.clone(),
    };
    (encoder, decoder)
}

#[derive(Serialize)]
struct RecognizedImage<'a> {
    image: &'a Path,
    #[serde(flatten)]
    recognition: &'a Recognition,
}

fn run_recognize(args: RecognizeArgs, config: &AppConfig) -> Result<()> {
    let (encoder_path, decoder_path) = model_paths(config, &args.model, args.quantized);
    let load_start = Instant::now();
    let encoder = OnnxSession::load(&encoder_path)?;
    let decoder = OnnxSession::load(&decoder_path)?;
    let vocab =
        TokenizerVocabulary::load(&config.tokenizer.source(), &config.tokenizer.special_tokens)?;
    let preprocessor = TrOcrPreprocessor::new(config.preprocess.clone(), Device::Cpu)?;
    let recognizer = TrOcrRecognizer::new(encoder, decoder, preprocessor, vocab, config.decode)?;
    info!(
        "Models ready in {:.2?} (encoder={}, decoder={}, max_length={})",
        load_start.elapsed(),
        encoder_path.display(),
        decoder_path.display(),
        config.decode.max_length
    );

    for path in &args.images {
        let start = Instant::now();
        let recognition = recognizer.recognize_path(path)?;
        info!(
            "Recognized {} in {:.2?} ({} steps, {:?})",
            path.display(),
            start.elapsed(),
            recognition.steps,
            recognition.finish_reason
        );
        if args.json {
            let line = RecognizedImage {
                image: path,
                recognition: &recognition,
            };
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!("{}", recognition.text);
        }
    }
    Ok(())
}

fn run_smoke(args: SmokeArgs, config: &AppConfig) -> Result<()> {
    let device = Device::Cpu;
    let run_encoder = args.model.encoder.is_some() || args.model.decoder.is_none();
    let run_decoder = args.model.decoder.is_some() || args.model.encoder.is_none();

    let mut encoder_states = None;
    if run_encoder {
        let session = OnnxSession::load(&config.models.encoder)?;
        let (report, states) = smoke_encoder(
            &session,
            config.preprocess.height as usize,
            config.preprocess.width as usize,
            &device,
        )?;
        println!("{}", report.render());
        encoder_states = Some(states);
    }

    if run_decoder {
        let bos = match args.bos {
            Some(id) => id,
            None => {
                TokenizerVocabulary::load(
                    &config.tokenizer.source(),
                    &config.tokenizer.special_tokens,
                )?
                .special_tokens()
                .bos
            }
        };
        let session = OnnxSession::load(&config.models.decoder)?;
        let report = smoke_decoder(&session, bos, encoder_states.as_ref(), &device)?;
        println!("{}", report.render());
    }
    Ok(())
}

fn describe(kind: &str, info: &TensorInfo) -> String {
    format!(
        "  {kind}: {} shape={} type={}",
        info.name,
        info.shape_label(),
        info.elem_type
    )
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    for path in &args.model {
        let model = read_model(path)?;
        let (inputs, outputs) = io_metadata(&model)
            .with_context(|| format!("failed to describe {}", path.display()))?;
        println!("{}", path.display());
        for info in &inputs {
            println!("{}", describe("input", info));
        }
        for info in &outputs {
            println!("{}", describe("output", info));
        }
    }
    Ok(())
}

fn run_vocab(args: VocabArgs, config: &AppConfig) -> Result<()> {
    let vocab =
        TokenizerVocabulary::load(&config.tokenizer.source(), &config.tokenizer.special_tokens)?;
    let specials = vocab.special_tokens();
    let names = &config.tokenizer.special_tokens;
    println!("BOS: {} ({})", specials.bos, names.bos);
    println!("EOS: {} ({})", specials.eos, names.eos);
    println!("PAD: {} ({})", specials.pad, names.pad);
    println!("Vocab size: {}", vocab.len());
    for (id, token) in vocab.tokens_by_id().into_iter().take(args.head) {
        println!("{id}\t{token}");
    }
    let written = vocab.dump_json(&args.out)?;
    println!("Wrote {written} tokens to {}", args.out.display());
    Ok(())
}

fn run_preprocess(args: PreprocessArgs, config: &AppConfig) -> Result<()> {
    let preprocessor = TrOcrPreprocessor::new(config.preprocess.clone(), Device::Cpu)?;
    let image = image::open(&args.image)
        .with_context(|| format!("failed to open image at {}", args.image.display()))?;
    let pixels = preprocessor.preprocess(&image)?;
    let flat = pixels.flatten_all()?;
    let head = args.head.min(flat.elem_count());
    let values = flat.narrow(0, 0, head)?.to_vec1::<f32>()?;
    println!("shape: {:?}", pixels.dims());
    println!("first {head} values: {values:?}");
    Ok(())
}
