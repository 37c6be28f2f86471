//! Narrow contract between the capture session and the camera hardware.
//!
//! Backends answer `bind` and `start_stream` asynchronously: they return as soon
//! as the request is accepted and report the outcome later through an
//! [`EventSink`]. Frames flow through a [`FrameSink`] handed over at stream start.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam_channel::Sender;
use tracing::trace;

use crate::types::{CaptureError, Frame, Resolution, SensorInfo};

/// Opaque handle to a bound physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque handle to a configured capture stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutofocusMode {
    Off,
    #[default]
    ContinuousPicture,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExposureMode {
    Off,
    #[default]
    Auto,
}

/// Scene illumination requested for every frame of the repeating request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Illumination {
    #[default]
    Off,
    /// Flash held on continuously.
    Torch,
    AutoFlash,
}

/// Capture settings reissued with every frame while streaming.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub autofocus: AutofocusMode,
    pub exposure: ExposureMode,
    pub illumination: Illumination,
}

/// Hardware capture collaborator.
pub trait CaptureBackend: Send + Sync {
    fn enumerate_sensors(&self) -> Result<Vec<SensorInfo>, CaptureError>;

    /// Start binding sensor `id`; the result arrives as `opened`, `disconnected` or `error`.
    fn bind(&self, id: &str, events: EventSink) -> Result<(), CaptureError>;

    /// Start streaming `resolution` from `device`; the result arrives as
    /// `configured` or `configure_failed`. Frames go to `frames` afterwards.
    fn start_stream(
        &self,
        device: DeviceHandle,
        resolution: Resolution,
        params: RequestParams,
        events: EventSink,
        frames: FrameSink,
    ) -> Result<(), CaptureError>;

    fn stop(&self, stream: StreamHandle) -> Result<(), CaptureError>;

    fn unbind(&self, device: DeviceHandle) -> Result<(), CaptureError>;
}

/// Hardware callback, stamped with the session generation it belongs to.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Opened(DeviceHandle),
    Disconnected(DeviceHandle),
    DeviceError(DeviceHandle, i32),
    Configured(StreamHandle),
    ConfigureFailed(String),
}

#[derive(Debug)]
pub(crate) enum Envelope {
    Event { generation: u64, event: SessionEvent },
    Shutdown,
}

/// Where a backend reports asynchronous outcomes. Cheap to clone, callable from any thread.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    tx: Sender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: Sender<Envelope>) -> Self {
        Self { generation, tx }
    }

    pub fn opened(&self, device: DeviceHandle) {
        self.post(SessionEvent::Opened(device));
    }

    pub fn disconnected(&self, device: DeviceHandle) {
        self.post(SessionEvent::Disconnected(device));
    }

    pub fn error(&self, device: DeviceHandle, code: i32) {
        self.post(SessionEvent::DeviceError(device, code));
    }

    pub fn configured(&self, stream: StreamHandle) {
        self.post(SessionEvent::Configured(stream));
    }

    pub fn configure_failed(&self, reason: impl Into<String>) {
        self.post(SessionEvent::ConfigureFailed(reason.into()));
    }

    fn post(&self, event: SessionEvent) {
        let generation = self.generation;
        if self.tx.send(Envelope::Event { generation, event }).is_err() {
            trace!(generation, "capture session gone, dropping hardware callback");
        }
    }
}

type DeliverFn = dyn Fn(Result<Frame, CaptureError>) + Send + Sync;

/// Frame reader endpoint. Once the owning session closes it, late frames are released unseen.
#[derive(Clone)]
pub struct FrameSink {
    deliver: Arc<DeliverFn>,
    active: Arc<AtomicBool>,
}

impl FrameSink {
    pub fn new(deliver: impl Fn(Result<Frame, CaptureError>) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Forward a frame (or an acquisition failure) to the consumer.
    pub fn deliver(&self, frame: Result<Frame, CaptureError>) {
        if self.is_active() {
            (self.deliver)(frame);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("active", &self.is_active())
            .finish()
    }
}
