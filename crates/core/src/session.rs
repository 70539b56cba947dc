use std::{collections::HashMap, fmt};

use anyhow::{Context, Result, anyhow, ensure};
use candle_core::Tensor;

/// One dimension of a declared model input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorDim {
    Fixed(usize),
    Symbolic(String),
    Unknown,
}

impl fmt::Display for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "{value}"),
            Self::Symbolic(name) => f.write_str(name),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// Name, declared shape and element type of a model input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<TensorDim>,
    pub elem_type: String,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, shape: Vec<TensorDim>, elem_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape,
            elem_type: elem_type.into(),
        }
    }

    /// Shape rendered as `[1, 3, height, ?]`.
    pub fn shape_label(&self) -> String {
        let dims = self
            .shape
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("[{dims}]")
    }
}

/// Named tensor bindings handed to [`ModelSession::run`].
pub type InputBindings = HashMap<String, Tensor>;

/// Synchronous inference capability shared by the calibration feeder, the
/// greedy decoder and the smoke checks.
pub trait ModelSession {
    fn inputs(&self) -> &[TensorInfo];

    fn outputs(&self) -> &[TensorInfo];

    /// Evaluate the model. `requested` selects outputs by name, in order;
    /// `None` returns every declared output in declaration order.
    fn run(&self, requested: Option<&[&str]>, inputs: InputBindings) -> Result<Vec<Tensor>>;
}

impl<S: ModelSession + ?Sized> ModelSession for &S {
    fn inputs(&self) -> &[TensorInfo] {
        (**self).inputs()
    }

    fn outputs(&self) -> &[TensorInfo] {
        (**self).outputs()
    }

    fn run(&self, requested: Option<&[&str]>, inputs: InputBindings) -> Result<Vec<Tensor>> {
        (**self).run(requested, inputs)
    }
}

impl<S: ModelSession + ?Sized> ModelSession for Box<S> {
    fn inputs(&self) -> &[TensorInfo] {
        (**self).inputs()
    }

    fn outputs(&self) -> &[TensorInfo] {
        (**self).outputs()
    }

    fn run(&self, requested: Option<&[&str]>, inputs: InputBindings) -> Result<Vec<Tensor>> {
        (**self).run(requested, inputs)
    }
}

/// Name of the input at `index`, failing when the model declares fewer inputs.
pub fn input_name(session: &impl ModelSession, index: usize) -> Result<String> {
    session
        .inputs()
        .get(index)
        .map(|info| info.name.clone())
        .ok_or_else(|| {
            anyhow!(
                "model declares {} input(s), input #{index} is required",
                session.inputs().len()
            )
        })
}

/// Run the session and return its first output.
pub fn run_first_output(session: &impl ModelSession, inputs: InputBindings) -> Result<Tensor> {
    let mut outputs = session.run(None, inputs)?;
    ensure!(!outputs.is_empty(), "model produced no outputs");
    Ok(outputs.swap_remove(0))
}

/// Run a single-input model (the image encoder) on `pixel_values`.
pub fn run_encoder(session: &impl ModelSession, pixel_values: &Tensor) -> Result<Tensor> {
    let name = input_name(session, 0).context("encoder input discovery failed")?;
    let mut inputs = InputBindings::new();
    inputs.insert(name, pixel_values.clone());
    run_first_output(session, inputs).context("encoder run failed")
}
