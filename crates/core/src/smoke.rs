use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use tracing::info;

use crate::{
    session::{InputBindings, ModelSession, TensorInfo, input_name},
    tensor::token_ids_tensor,
};

/// Encoder output shape of trocr-base: 577 patch positions of width 768.
pub const DUMMY_ENCODER_STATES_SHAPE: (usize, usize, usize) = (1, 577, 768);

/// Declared I/O of a model plus the shapes one zero-input run produced.
#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub label: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub output_shapes: Vec<Vec<usize>>,
}

#[derive(Serialize)]
struct ShapeRow<'a> {
    name: &'a str,
    shape: &'a [usize],
}

impl SmokeReport {
    fn new(label: &str, session: &impl ModelSession, produced: &[Tensor]) -> Self {
        Self {
            label: label.to_string(),
            inputs: session.inputs().to_vec(),
            outputs: session.outputs().to_vec(),
            output_shapes: produced.iter().map(|t| t.dims().to_vec()).collect(),
        }
    }

    /// Multi-line summary: declared inputs, declared outputs, produced shapes.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("{} I/O:", self.label)];
        for info in &self.inputs {
            lines.push(format!(
                "  input: {} shape={} type={}",
                info.name,
                info.shape_label(),
                info.elem_type
            ));
        }
        for info in &self.outputs {
            lines.push(format!(
                "  output: {} shape={} type={}",
                info.name,
                info.shape_label(),
                info.elem_type
            ));
        }
        let rows: Vec<ShapeRow<'_>> = self
            .outputs
            .iter()
            .map(|info| info.name.as_str())
            .chain(std::iter::repeat("?"))
            .zip(&self.output_shapes)
            .map(|(name, shape)| ShapeRow { name, shape })
            .collect();
        lines.push(format!(
            "{} output shapes: {}",
            self.label,
            serde_json::to_string(&rows).unwrap_or_default()
        ));
        lines.join("\n")
    }
}

/// Run the encoder on an all-zeros `[1, 3, height, width]` image.
///
/// Returns the first encoder output so it can drive [`smoke_decoder`].
pub fn smoke_encoder(
    session: &impl ModelSession,
    height: usize,
    width: usize,
    device: &Device,
) -> Result<(SmokeReport, Tensor)> {
    let name = input_name(session, 0)?;
    let dummy = Tensor::zeros((1, 3, height, width), DType::F32, device)?;
    let mut inputs = InputBindings::new();
    inputs.insert(name, dummy);
    let outputs = session.run(None, inputs).context("encoder smoke run failed")?;
    let report = SmokeReport::new("Encoder", session, &outputs);
    let first = outputs
        .into_iter()
        .next()
        .context("encoder produced no outputs")?;
    info!(shape = ?first.dims(), "encoder smoke run ok");
    Ok((report, first))
}

/// Run the decoder once on `[[bos]]` against `encoder_states`, or against a
/// zeros tensor of [`DUMMY_ENCODER_STATES_SHAPE`] when none is given.
pub fn smoke_decoder(
    session: &impl ModelSession,
    bos: u32,
    encoder_states: Option<&Tensor>,
    device: &Device,
) -> Result<SmokeReport> {
    let ids_name = input_name(session, 0)?;
    let states_name = input_name(session, 1)?;
    let states = match encoder_states {
        Some(states) => states.clone(),
        None => Tensor::zeros(DUMMY_ENCODER_STATES_SHAPE, DType::F32, device)?,
    };
    let mut inputs = InputBindings::new();
    inputs.insert(ids_name, token_ids_tensor(&[bos], device)?);
    inputs.insert(states_name, states);
    let outputs = session.run(None, inputs).context("decoder smoke run failed")?;
    info!(
        outputs = outputs.len(),
        logits = ?outputs.first().map(|t| t.dims().to_vec()),
        "decoder smoke run ok"
    );
    Ok(SmokeReport::new("Decoder", session, &outputs))
}
