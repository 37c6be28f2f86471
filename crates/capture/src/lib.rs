//! Camera-side half of the classification pipeline: sensor types, output size
//! selection, and the session state machine that owns the hardware.

pub mod backend;
pub mod lock;
pub mod session;
pub mod size;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{
    AutofocusMode, CaptureBackend, DeviceHandle, EventSink, ExposureMode, FrameSink, Illumination,
    RequestParams, StreamHandle,
};
pub use lock::{HardwareLock, LockToken};
pub use session::{
    CaptureSession, DEFAULT_LOCK_TIMEOUT_MS, RepeatingRequest, SessionOptions, SessionState,
};
pub use size::select_optimal;
pub use types::{CaptureError, Facing, Frame, FrameFormat, Orientation, Resolution, SensorInfo};
