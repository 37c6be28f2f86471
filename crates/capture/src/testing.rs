//! Scripted in-memory camera backend.
//!
//! Answers hardware requests according to a configurable script and records
//! every call so tests can assert on teardown order.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::{
    backend::{CaptureBackend, DeviceHandle, EventSink, FrameSink, RequestParams, StreamHandle},
    types::{CaptureError, Frame, FrameFormat, Resolution, SensorInfo},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Enumerate,
    Bind(String),
    StartStream(DeviceHandle, Resolution, RequestParams),
    Stop(StreamHandle),
    Unbind(DeviceHandle),
}

/// How the backend answers `bind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Open,
    Disconnect,
    Error(i32),
    /// Hold the answer until [`ScriptedBackend::complete_pending_bind`].
    Hang,
}

/// How the backend answers `start_stream`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Configure,
    Fail(String),
    Reject(String),
}

struct Script {
    bind: BindOutcome,
    stream: StreamOutcome,
    pending_bind: Option<(EventSink, DeviceHandle)>,
    bound: Option<(EventSink, DeviceHandle)>,
    frames: Option<FrameSink>,
}

pub struct ScriptedBackend {
    sensors: Vec<SensorInfo>,
    script: Mutex<Script>,
    calls: Mutex<Vec<BackendCall>>,
    next_handle: AtomicU64,
    failing_teardown: AtomicBool,
    panicking_unbind: AtomicBool,
    held_enumeration: Mutex<Option<Receiver<()>>>,
}

impl ScriptedBackend {
    pub fn new(sensors: Vec<SensorInfo>) -> Self {
        Self {
            sensors,
            script: Mutex::new(Script {
                bind: BindOutcome::Open,
                stream: StreamOutcome::Configure,
                pending_bind: None,
                bound: None,
                frames: None,
            }),
            calls: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            failing_teardown: AtomicBool::new(false),
            panicking_unbind: AtomicBool::new(false),
            held_enumeration: Mutex::new(None),
        }
    }

    pub fn set_bind_outcome(&self, outcome: BindOutcome) {
        self.script().bind = outcome;
    }

    pub fn set_stream_outcome(&self, outcome: StreamOutcome) {
        self.script().stream = outcome;
    }

    /// Make `stop` and `unbind` report failures.
    pub fn fail_teardown(&self, fail: bool) {
        self.failing_teardown.store(fail, Ordering::SeqCst);
    }

    /// Make `unbind` panic after recording the call.
    pub fn panic_on_unbind(&self, panic: bool) {
        self.panicking_unbind.store(panic, Ordering::SeqCst);
    }

    /// Block the next `enumerate_sensors` until the returned sender sends or is dropped.
    pub fn hold_enumeration(&self) -> Sender<()> {
        let (resume, held) = bounded(0);
        *self
            .held_enumeration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(held);
        resume
    }

    /// Answer a bind held back by [`BindOutcome::Hang`]. Returns false if none is pending.
    pub fn complete_pending_bind(&self) -> bool {
        let pending = self.script().pending_bind.take();
        match pending {
            Some((events, device)) => {
                self.script().bound = Some((events.clone(), device));
                events.opened(device);
                true
            }
            None => false,
        }
    }

    /// Report the bound device as unplugged.
    pub fn disconnect(&self) -> bool {
        match self.script().bound.clone() {
            Some((events, device)) => {
                events.disconnected(device);
                true
            }
            None => false,
        }
    }

    /// Report a fatal error on the bound device.
    pub fn fail_device(&self, code: i32) -> bool {
        match self.script().bound.clone() {
            Some((events, device)) => {
                events.error(device, code);
                true
            }
            None => false,
        }
    }

    /// Deliver `frame` through the current stream's reader on the calling thread.
    ///
    /// Returns whether a live reader took it; otherwise the frame is released here.
    pub fn push_frame(&self, frame: Frame) -> bool {
        self.push(Ok(frame))
    }

    pub fn push_acquisition_failure(&self, reason: &str) -> bool {
        self.push(Err(CaptureError::FrameAcquisitionFailed(reason.into())))
    }

    fn push(&self, frame: Result<Frame, CaptureError>) -> bool {
        let sink = self.script().frames.clone();
        match sink {
            Some(sink) if sink.is_active() => {
                sink.deliver(frame);
                true
            }
            _ => false,
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the call log until `predicate` matches or `timeout` passes.
    pub fn wait_for_call(
        &self,
        predicate: impl Fn(&BackendCall) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.calls().iter().any(&predicate) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn teardown_result(&self, what: &str) -> Result<(), CaptureError> {
        if self.failing_teardown.load(Ordering::SeqCst) {
            Err(CaptureError::Backend(format!("{what} failed")))
        } else {
            Ok(())
        }
    }
}

impl CaptureBackend for ScriptedBackend {
    fn enumerate_sensors(&self) -> Result<Vec<SensorInfo>, CaptureError> {
        self.record(BackendCall::Enumerate);
        let held = self
            .held_enumeration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(held) = held {
            let _ = held.recv();
        }
        Ok(self.sensors.clone())
    }

    fn bind(&self, id: &str, events: EventSink) -> Result<(), CaptureError> {
        self.record(BackendCall::Bind(id.to_string()));
        let device = DeviceHandle(self.next_handle());
        let mut script = self.script();
        match script.bind {
            BindOutcome::Open => {
                script.bound = Some((events.clone(), device));
                events.opened(device);
            }
            BindOutcome::Disconnect => events.disconnected(device),
            BindOutcome::Error(code) => events.error(device, code),
            BindOutcome::Hang => script.pending_bind = Some((events, device)),
        }
        Ok(())
    }

    fn start_stream(
        &self,
        device: DeviceHandle,
        resolution: Resolution,
        params: RequestParams,
        events: EventSink,
        frames: FrameSink,
    ) -> Result<(), CaptureError> {
        self.record(BackendCall::StartStream(device, resolution, params));
        let mut script = self.script();
        match script.stream.clone() {
            StreamOutcome::Configure => {
                script.frames = Some(frames);
                events.configured(StreamHandle(self.next_handle()));
                Ok(())
            }
            StreamOutcome::Fail(reason) => {
                events.configure_failed(reason);
                Ok(())
            }
            StreamOutcome::Reject(reason) => Err(CaptureError::Backend(reason)),
        }
    }

    fn stop(&self, stream: StreamHandle) -> Result<(), CaptureError> {
        self.record(BackendCall::Stop(stream));
        self.script().frames = None;
        self.teardown_result("stop")
    }

    fn unbind(&self, device: DeviceHandle) -> Result<(), CaptureError> {
        self.record(BackendCall::Unbind(device));
        let mut script = self.script();
        if script.bound.as_ref().is_some_and(|(_, bound)| *bound == device) {
            script.bound = None;
        }
        drop(script);
        if self.panicking_unbind.load(Ordering::SeqCst) {
            panic!("scripted unbind failure for {device:?}");
        }
        self.teardown_result("unbind")
    }
}

/// Solid grey RGB frame whose release bumps `released`.
pub fn test_frame(resolution: Resolution, released: &Arc<AtomicUsize>) -> Frame {
    let len = resolution.area() as usize * FrameFormat::Rgb8.bytes_per_pixel();
    let released = released.clone();
    Frame::new(vec![128; len], resolution, FrameFormat::Rgb8).with_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
    })
}
