use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use candle_core::Tensor;
use tracing::{debug, info};
use trocr_int8_core::{InputBindings, ModelSession, TensorInfo};

use crate::{
    error::{OnnxError, Result},
    lower::{LoweringStats, has_qdq, lower_qdq},
    model::{graph, graph_mut, io_metadata, produced_names, read_model, tensor_info},
    proto::{DataType, ModelProto, tensor_value_info},
};

/// An ONNX graph evaluated on the CPU through candle-onnx.
///
/// QDQ graphs are lowered to float ops at load time; declared inputs and
/// outputs are those of the original file.
#[derive(Debug, Clone)]
pub struct OnnxSession {
    model: ModelProto,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
    lowering: LoweringStats,
}

impl OnnxSession {
    pub fn load(path: &Path) -> Result<Self> {
        let session = Self::from_model(read_model(path)?)?;
        info!(
            path = %path.display(),
            inputs = session.inputs.len(),
            outputs = session.outputs.len(),
            lowered = !session.lowering.is_empty(),
            "onnx session ready"
        );
        Ok(session)
    }

    pub fn from_model(model: ModelProto) -> Result<Self> {
        let (inputs, outputs) = io_metadata(&model)?;
        let (model, lowering) = if has_qdq(&model) {
            lower_qdq(&model)?
        } else {
            (model, LoweringStats::default())
        };
        Ok(Self {
            model,
            inputs,
            outputs,
            lowering,
        })
    }

    /// Copy of this session that also returns the named intermediate tensors.
    ///
    /// Names already declared as outputs are not duplicated. Extra outputs are
    /// appended after the original ones, in the order given.
    pub fn with_extra_outputs(&self, names: &[String]) -> Result<Self> {
        let mut model = self.model.clone();
        {
            let graph = graph(&model)?;
            let produced = produced_names(graph);
            if let Some(missing) = names.iter().find(|n| !produced.contains(n.as_str())) {
                return Err(OnnxError::UnknownOutput(missing.clone()));
            }
        }
        let graph = graph_mut(&mut model)?;
        let mut declared: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
        let mut outputs = self.outputs.clone();
        for name in names {
            if declared.insert(name.clone()) {
                let info = tensor_value_info(name.clone(), DataType::Float);
                outputs.push(tensor_info(&info));
                graph.output.push(info);
            }
        }
        debug!(added = outputs.len() - self.outputs.len(), "extra outputs declared");
        Ok(Self {
            model,
            inputs: self.inputs.clone(),
            outputs,
            lowering: self.lowering,
        })
    }

    /// The graph actually evaluated, after any QDQ lowering.
    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    pub fn lowering(&self) -> LoweringStats {
        self.lowering
    }

    fn check_inputs(&self, inputs: &InputBindings) -> Result<()> {
        for name in inputs.keys() {
            if !self.inputs.iter().any(|info| &info.name == name) {
                return Err(OnnxError::UnknownInput(name.clone()));
            }
        }
        if let Some(missing) = self.inputs.iter().find(|info| !inputs.contains_key(&info.name)) {
            return Err(OnnxError::MissingInput(missing.name.clone()));
        }
        Ok(())
    }

    pub fn evaluate(
        &self,
        requested: Option<&[&str]>,
        inputs: InputBindings,
    ) -> Result<Vec<Tensor>> {
        self.check_inputs(&inputs)?;
        if let Some(names) = requested
            && let Some(unknown) = names
                .iter()
                .find(|n| !self.outputs.iter().any(|info| info.name == **n))
        {
            return Err(OnnxError::UnknownOutput(unknown.to_string()));
        }
        let mut values: HashMap<String, Tensor> = candle_onnx::simple_eval(&self.model, inputs)?;
        let names: Vec<&str> = match requested {
            Some(names) => names.to_vec(),
            None => self.outputs.iter().map(|info| info.name.as_str()).collect(),
        };
        names
            .into_iter()
            .map(|name| {
                values
                    .remove(name)
                    .ok_or_else(|| OnnxError::UnknownOutput(name.to_string()))
            })
            .collect()
    }
}

impl ModelSession for OnnxSession {
    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn run(&self, requested: Option<&[&str]>, inputs: InputBindings) -> anyhow::Result<Vec<Tensor>> {
        Ok(self.evaluate(requested, inputs)?)
    }
}
