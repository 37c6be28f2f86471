//! Inference boundary: the engine contract, frame preprocessing, and the
//! classifier that reduces an engine's output to a single label.

pub mod classifier;
pub mod engine;
pub mod preprocess;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use classifier::{ClassificationResult, Classifier, ClassifyError, top_label};
pub use engine::{
    EngineError, InferenceEngine, InputShape, InputTensor, ModelHandle, OutputDistribution,
};

#[cfg(feature = "with-tch")]
pub use tch;
#[cfg(feature = "with-tch")]
pub use torch::TorchEngine;
