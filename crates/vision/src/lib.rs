//! Live classification pipeline: drop-on-busy admission, preview geometry, and
//! the orchestrator that moves camera frames through inference to a display.

pub mod convert;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod sink;
pub mod transform;

pub use convert::{ConvertError, FrameConverter, PackedConverter};
pub use error::PipelineError;
pub use gate::{Admission, FrameGate};
pub use pipeline::{
    Pipeline,
    config::{
        CameraArg, DEFAULT_SESSION_TIMEOUT_MS, IlluminationArg, PipelineCliArgs, PipelineConfig,
        TelemetryOptions,
    },
    telemetry,
};
pub use sink::DisplaySink;
pub use transform::{AffineMatrix, Rect, compute_transform, fit_to_aspect, preview_aspect};
