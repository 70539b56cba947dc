use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use trocr_int8_config::{
    ArgGroups, ConfigArgs, ConfigOverrides, DecodeArgs, ModelArgs, QuantizationArgs,
    StaticQuantizationArgs, build_config_overrides,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "TrOCR int8 quantization and inference CLI", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Quiet mode - only warnings and errors are logged.
    #[arg(short, long, global = true, help_heading = "Application")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Quantize an ONNX model to int8.
    Quantize(QuantizeArgs),
    /// Recognize text in one or more line images.
    Recognize(RecognizeArgs),
    /// Run the encoder and decoder once on dummy inputs.
    Smoke(SmokeArgs),
    /// Print the inputs and outputs an ONNX model declares.
    Inspect(InspectArgs),
    /// Print the special tokens and dump the tokenizer vocabulary.
    Vocab(VocabArgs),
    /// Print the first pixel values the preprocessor produces for an image.
    Preprocess(PreprocessArgs),
}

#[derive(ClapArgs, Debug)]
pub struct QuantizeArgs {
    #[command(subcommand)]
    pub command: QuantizeCommand,
}

#[derive(Subcommand, Debug)]
pub enum QuantizeCommand {
    /// Weight-only quantization, no calibration.
    Dynamic(DynamicArgs),
    /// Weight and activation quantization calibrated on a directory of images.
    Static(StaticArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct QuantizeIo {
    /// Float ONNX model to quantize.
    #[arg(long = "in", value_name = "PATH", help_heading = "Quantization")]
    pub input: PathBuf,

    /// Destination of the quantized model; defaults to `<input stem>_int8.onnx`.
    #[arg(long = "out", value_name = "PATH", help_heading = "Quantization")]
    pub output: Option<PathBuf>,
}

impl QuantizeIo {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let stem = self
                .input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_string());
            self.input.with_file_name(format!("{stem}_int8.onnx"))
        })
    }
}

#[derive(ClapArgs, Debug)]
pub struct DynamicArgs {
    #[command(flatten)]
    pub io: QuantizeIo,

    #[command(flatten)]
    pub quantization: QuantizationArgs,
}

#[derive(ClapArgs, Debug)]
pub struct StaticArgs {
    #[command(flatten)]
    pub io: QuantizeIo,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub quantization: QuantizationArgs,

    #[command(flatten)]
    pub static_quantization: StaticQuantizationArgs,
}

#[derive(ClapArgs, Debug)]
pub struct RecognizeArgs {
    /// Line images to recognize, in order.
    #[arg(long = "image", value_name = "PATH", required = true)]
    pub images: Vec<PathBuf>,

    /// Use the configured quantized encoder/decoder instead of the float models.
    #[arg(long, help_heading = "Model")]
    pub quantized: bool,

    /// Print one JSON object per image instead of plain text.
    #[arg(long, help_heading = "Application")]
    pub json: bool,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub decode: DecodeArgs,
}

#[derive(ClapArgs, Debug)]
pub struct SmokeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Decoder start token; looked up in the tokenizer when omitted.
    #[arg(long, value_name = "ID", help_heading = "Model")]
    pub bos: Option<u32>,
}

#[derive(ClapArgs, Debug)]
pub struct InspectArgs {
    /// ONNX model to describe.
    #[arg(long, value_name = "PATH", required = true)]
    pub model: Vec<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct VocabArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Where the full vocabulary is written as JSON.
    #[arg(long, value_name = "PATH", default_value = "vocab_dump.json")]
    pub out: PathBuf,

    /// Number of tokens printed in id order.
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub head: usize,
}

#[derive(ClapArgs, Debug)]
pub struct PreprocessArgs {
    /// Image to preprocess.
    #[arg(long, value_name = "PATH")]
    pub image: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Number of leading values printed.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub head: usize,
}

impl Cli {
    /// Override patch for the flag groups the selected subcommand accepts.
    pub fn config_overrides(&self) -> ConfigOverrides {
        let groups = match &self.command {
            CliCommand::Quantize(QuantizeArgs {
                command: QuantizeCommand::Dynamic(args),
            }) => ArgGroups {
                quantization: Some(&args.quantization),
                ..Default::default()
            },
            CliCommand::Quantize(QuantizeArgs {
                command: QuantizeCommand::Static(args),
            }) => ArgGroups {
                model: Some(&args.model),
                quantization: Some(&args.quantization),
                static_quantization: Some(&args.static_quantization),
                ..Default::default()
            },
            CliCommand::Recognize(args) => ArgGroups {
                model: Some(&args.model),
                decode: Some(&args.decode),
                ..Default::default()
            },
            CliCommand::Smoke(args) => ArgGroups {
                model: Some(&args.model),
                ..Default::default()
            },
            CliCommand::Vocab(args) => ArgGroups {
                model: Some(&args.model),
                ..Default::default()
            },
            CliCommand::Preprocess(args) => ArgGroups {
                model: Some(&args.model),
                ..Default::default()
            },
            CliCommand::Inspect(_) => ArgGroups::default(),
        };
        build_config_overrides(&self.config, groups)
    }
}
