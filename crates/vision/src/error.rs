use std::io;

use capture::CaptureError;
use ml_core::ClassifyError;
use thiserror::Error;

use crate::convert::ConvertError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("failed to start inference worker: {0}")]
    Worker(#[source] io::Error),
    #[error("inference worker panicked")]
    WorkerPanicked,
}

impl PipelineError {
    /// Errors after which the capture flow must be abandoned rather than retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Capture(err) => !matches!(
                err,
                CaptureError::ConfigureFailed(_) | CaptureError::FrameAcquisitionFailed(_)
            ),
            PipelineError::Classify(err) => matches!(
                err,
                ClassifyError::ModelLoad(_) | ClassifyError::UnsupportedInput { .. }
            ),
            PipelineError::Convert(_) => false,
            PipelineError::Worker(_) | PipelineError::WorkerPanicked => true,
        }
    }
}
