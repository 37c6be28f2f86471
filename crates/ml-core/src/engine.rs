//! Inference engine collaborator contract.

use std::path::Path;

use capture::Resolution;
use thiserror::Error;

/// Opaque handle to a model loaded by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

/// Spatial size and channel count a model expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputShape {
    pub size: Resolution,
    pub channels: u32,
}

/// Normalised HWC float tensor handed to the engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputTensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Label scores in the order the engine produced them.
pub type OutputDistribution = Vec<(String, f32)>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("unknown model handle {0:?}")]
    UnknownModel(ModelHandle),
    #[error("inference failed: {0}")]
    Run(String),
}

/// On-device inference engine.
pub trait InferenceEngine: Send {
    fn load_model(&mut self, path: &Path) -> Result<ModelHandle, EngineError>;

    fn input_shape(&self, model: ModelHandle) -> Result<InputShape, EngineError>;

    fn run(
        &mut self,
        model: ModelHandle,
        input: &InputTensor,
    ) -> Result<OutputDistribution, EngineError>;

    fn unload(&mut self, model: ModelHandle);
}
