//! TorchScript-backed classification engine.

use std::{collections::HashMap, convert::TryFrom, fs, path::Path};

use capture::Resolution;
use tch::{self, Device, Kind, Tensor};
use tracing::{debug, warn};

use crate::engine::{
    EngineError, InferenceEngine, InputShape, InputTensor, ModelHandle, OutputDistribution,
};

struct LoadedModel {
    module: tch::CModule,
}

/// Runs TorchScript image classifiers that take `[1, 3, H, W]` float input and
/// return one logit per label.
pub struct TorchEngine {
    device: Device,
    labels: Vec<String>,
    input: InputShape,
    models: HashMap<u64, LoadedModel>,
    next_id: u64,
}

impl TorchEngine {
    /// `labels_path` is a newline-separated label list matching the model's outputs.
    pub fn new<P: AsRef<Path>>(
        device: Device,
        labels_path: P,
        input_size: Resolution,
    ) -> Result<Self, EngineError> {
        let path = labels_path.as_ref();
        let labels = fs::read_to_string(path)
            .map_err(|err| EngineError::Load {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        debug!(labels = labels.len(), "loaded label list from {}", path.display());

        Ok(Self {
            device,
            labels,
            input: InputShape {
                size: input_size,
                channels: 3,
            },
            models: HashMap::new(),
            next_id: 1,
        })
    }

    fn to_tensor(&self, input: &InputTensor) -> Result<Tensor, EngineError> {
        let expected = (input.width * input.height * input.channels) as usize;
        if input.data.len() != expected {
            return Err(EngineError::Run(format!(
                "unexpected input buffer size: got {} values, expected {expected}",
                input.data.len()
            )));
        }
        Ok(Tensor::from_slice(&input.data)
            .to_device(self.device)
            .view([
                1,
                i64::from(input.height),
                i64::from(input.width),
                i64::from(input.channels),
            ])
            .permute([0, 3, 1, 2]))
    }
}

impl InferenceEngine for TorchEngine {
    fn load_model(&mut self, path: &Path) -> Result<ModelHandle, EngineError> {
        let module =
            tch::CModule::load_on_device(path, self.device).map_err(|err| EngineError::Load {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        let id = self.next_id;
        self.next_id += 1;
        self.models.insert(id, LoadedModel { module });
        Ok(ModelHandle(id))
    }

    fn input_shape(&self, model: ModelHandle) -> Result<InputShape, EngineError> {
        if self.models.contains_key(&model.0) {
            Ok(self.input)
        } else {
            Err(EngineError::UnknownModel(model))
        }
    }

    fn run(
        &mut self,
        model: ModelHandle,
        input: &InputTensor,
    ) -> Result<OutputDistribution, EngineError> {
        let tensor = self.to_tensor(input)?;
        let loaded = self
            .models
            .get(&model.0)
            .ok_or(EngineError::UnknownModel(model))?;
        let logits = loaded
            .module
            .forward_ts(&[tensor])
            .map_err(|err| EngineError::Run(err.to_string()))?;
        let probs = logits
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .flatten(0, -1);
        let scores =
            Vec::<f32>::try_from(&probs).map_err(|err| EngineError::Run(err.to_string()))?;

        if scores.len() != self.labels.len() {
            warn!(
                scores = scores.len(),
                labels = self.labels.len(),
                "model output size does not match label count"
            );
        }

        Ok(self.labels.iter().cloned().zip(scores).collect())
    }

    fn unload(&mut self, model: ModelHandle) {
        if self.models.remove(&model.0).is_none() {
            debug!(?model, "unload requested for unknown model");
        }
    }
}
