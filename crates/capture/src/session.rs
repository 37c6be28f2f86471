//! Camera session state machine.
//!
//! ```text
//! CLOSED -> OPENING -> OPEN -> CONFIGURING -> STREAMING
//!    ^         \________\__________\______________\----> ERROR
//!    '------------------ CLOSING <--------------------- (any)
//! ```
//!
//! Caller-driven transitions (`open`, `configure`, `close`) run on the caller's
//! thread. Hardware-driven transitions run on a dedicated callback thread owned
//! by the session, one handler per event kind. Every callback carries the
//! generation it was issued under; callbacks from a generation that `close` has
//! already retired only release the hardware they refer to and never touch the
//! session's state.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, warn};

use crate::{
    backend::{
        CaptureBackend, DeviceHandle, Envelope, EventSink, FrameSink, RequestParams,
        SessionEvent, StreamHandle,
    },
    lock::{HardwareLock, LockToken},
    types::{CaptureError, Facing, Resolution, SensorInfo},
};

/// Default bound on waiting for the camera lock in [`CaptureSession::open`].
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_500;

/// How often `close` rechecks a lock held outside the session.
const CLOSE_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Open,
    Configuring,
    Streaming,
    Closing,
    Error,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Configuring => "configuring",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub lock_timeout: Duration,
    pub request: RequestParams,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            request: RequestParams::default(),
        }
    }
}

/// Capture request reissued for every frame while the session streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepeatingRequest {
    pub resolution: Resolution,
    pub params: RequestParams,
}

/// Owner of one physical camera binding.
pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    lock: HardwareLock,
    lock_timeout: Duration,
    shared: Arc<Shared>,
    events_tx: Sender<Envelope>,
    losses: Receiver<CaptureError>,
    callbacks: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    request: RequestParams,
    losses: Sender<CaptureError>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    generation: u64,
    /// Lock token held from `open` until the device answers.
    open_window: Option<LockToken>,
    device: Option<DeviceHandle>,
    /// Resolution requested by an in-flight `configure`.
    pending: Option<Resolution>,
    stream: Option<StreamHandle>,
    request: Option<RepeatingRequest>,
    reader: Option<FrameSink>,
    failure: Option<CaptureError>,
}

/// Hardware handles detached from the session, released in creation-reverse order.
#[derive(Default)]
struct Teardown {
    request: Option<RepeatingRequest>,
    stream: Option<StreamHandle>,
    device: Option<DeviceHandle>,
    reader: Option<FrameSink>,
}

impl Teardown {
    /// A panicking backend stops the hardware calls but never the caller; the
    /// frame reader is closed either way.
    fn release(self, backend: &dyn CaptureBackend) {
        let Teardown {
            request,
            stream,
            device,
            reader,
        } = self;
        let released = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(request) = request {
                debug!(resolution = %request.resolution, "cancelling repeating request");
            }
            if let Some(stream) = stream {
                if let Err(err) = backend.stop(stream) {
                    warn!("failed to stop capture stream {stream:?}: {err}");
                }
            }
            if let Some(device) = device {
                if let Err(err) = backend.unbind(device) {
                    warn!("failed to unbind camera {device:?}: {err}");
                }
            }
        }));
        if released.is_err() {
            error!("camera teardown panicked; continuing shutdown");
        }
        if let Some(reader) = reader {
            reader.close();
        }
    }
}

impl Inner {
    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "capture session transition");
            metrics::counter!("capture_session_transitions_total", "state" => state.label())
                .increment(1);
            self.state = state;
        }
    }

    /// Detach every hardware handle the session holds.
    fn detach_all(&mut self) -> Teardown {
        self.pending = None;
        Teardown {
            request: self.request.take(),
            stream: self.stream.take(),
            device: self.device.take(),
            reader: self.reader.take(),
        }
    }

    fn owns_device(&self, device: DeviceHandle) -> bool {
        self.state == SessionState::Opening || self.device == Some(device)
    }

    fn on_opened(&mut self, device: DeviceHandle) -> Teardown {
        if self.state != SessionState::Opening {
            warn!(state = %self.state, "unexpected camera open callback");
            return Teardown {
                device: Some(device),
                ..Teardown::default()
            };
        }
        self.device = Some(device);
        self.open_window = None;
        self.set_state(SessionState::Open);
        Teardown::default()
    }

    /// Drop a device that went away. Returns the failure to report as a loss
    /// when the device had finished opening; failures while still opening reach
    /// the caller through [`CaptureSession::wait_for`].
    fn on_lost(
        &mut self,
        device: DeviceHandle,
        next: SessionState,
        failure: CaptureError,
    ) -> (Teardown, Option<CaptureError>) {
        if !self.owns_device(device) {
            debug!(?device, "loss reported for a device this session no longer holds");
            return (Teardown::default(), None);
        }
        let was_open = matches!(
            self.state,
            SessionState::Open | SessionState::Configuring | SessionState::Streaming
        );
        self.open_window = None;
        let mut teardown = self.detach_all();
        teardown.device = Some(device);
        self.failure = Some(failure.clone());
        self.set_state(next);
        (teardown, was_open.then_some(failure))
    }

    fn on_configured(&mut self, stream: StreamHandle, params: RequestParams) -> Teardown {
        match (self.state, self.pending.take()) {
            (SessionState::Configuring, Some(resolution)) => {
                self.stream = Some(stream);
                self.request = Some(RepeatingRequest { resolution, params });
                self.set_state(SessionState::Streaming);
                Teardown::default()
            }
            _ => {
                warn!(state = %self.state, "unexpected stream configured callback");
                Teardown {
                    stream: Some(stream),
                    ..Teardown::default()
                }
            }
        }
    }

    fn on_configure_failed(&mut self, reason: String) -> Teardown {
        if self.state != SessionState::Configuring {
            return Teardown::default();
        }
        warn!("camera stream configuration failed: {reason}");
        self.pending = None;
        self.failure = Some(CaptureError::ConfigureFailed(reason));
        self.set_state(SessionState::Open);
        Teardown {
            reader: self.reader.take(),
            ..Teardown::default()
        }
    }
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>, options: SessionOptions) -> Self {
        let (losses_tx, losses) = unbounded();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            request: options.request,
            losses: losses_tx,
        });
        let (events_tx, events_rx) = unbounded();
        let callbacks = spawn_callback_thread(shared.clone(), backend.clone(), events_rx);

        Self {
            backend,
            lock: HardwareLock::new(),
            lock_timeout: options.lock_timeout,
            shared,
            events_tx,
            losses,
            callbacks: Some(callbacks),
        }
    }

    /// Bind the first sensor facing `selector`.
    ///
    /// Fails with [`CaptureError::LockTimeout`] when the camera lock cannot be
    /// taken within the configured timeout; callers are expected to abandon the
    /// capture flow rather than retry. On success the session is `Opening` and
    /// becomes `Open` once the hardware answers. A `close` that lands before
    /// the bind is issued makes this return [`CaptureError::Cancelled`].
    pub fn open(&self, selector: Facing) -> Result<SensorInfo, CaptureError> {
        let token = self.lock.try_acquire_for(self.lock_timeout).ok_or_else(|| {
            let timeout_ms = self.lock_timeout.as_millis() as u64;
            error!(timeout_ms, "timed out waiting to lock camera opening");
            CaptureError::LockTimeout { timeout_ms }
        })?;

        // The token is parked in the open window before any hardware call so
        // that `close` can claim it and retire this attempt at any point.
        let (generation, previous) = {
            let mut inner = self.shared.lock();
            let previous = inner.state;
            if !matches!(previous, SessionState::Closed | SessionState::Error) {
                return Err(CaptureError::InvalidState {
                    op: "open",
                    state: previous,
                });
            }
            inner.generation += 1;
            inner.failure = None;
            inner.open_window = Some(token);
            inner.set_state(SessionState::Opening);
            (inner.generation, previous)
        };
        self.shared.changed.notify_all();

        let sensor = match self.find_sensor(selector) {
            Ok(sensor) => sensor,
            Err(err) => {
                self.abandon_open(generation, previous, None);
                return Err(err);
            }
        };
        if self.shared.lock().generation != generation {
            debug!(sensor = %sensor.id, "camera open cancelled before binding");
            return Err(CaptureError::Cancelled);
        }
        debug!(sensor = %sensor.id, facing = %sensor.facing, "binding camera");

        let events = EventSink::new(generation, self.events_tx.clone());
        if let Err(err) = self.backend.bind(&sensor.id, events) {
            self.abandon_open(generation, SessionState::Error, Some(err.clone()));
            return Err(err);
        }
        // A close racing the bind retires the generation; the device it
        // produces is released as a stale callback.
        if self.shared.lock().generation != generation {
            return Err(CaptureError::Cancelled);
        }

        Ok(sensor)
    }

    fn find_sensor(&self, selector: Facing) -> Result<SensorInfo, CaptureError> {
        self.backend
            .enumerate_sensors()?
            .into_iter()
            .find(|sensor| sensor.facing == selector)
            .ok_or(CaptureError::NoSensor(selector))
    }

    /// Leave `Opening` after a failed attempt, unless `close` already retired it.
    fn abandon_open(&self, generation: u64, next: SessionState, failure: Option<CaptureError>) {
        let mut inner = self.shared.lock();
        if inner.generation == generation {
            inner.open_window = None;
            inner.failure = failure;
            inner.set_state(next);
        }
        drop(inner);
        self.shared.changed.notify_all();
    }

    /// Ask the open device to stream `resolution` into `frames`.
    ///
    /// Returns once the request is accepted; the session reaches `Streaming`
    /// when the hardware confirms, or drops back to `Open` with
    /// [`CaptureError::ConfigureFailed`] recorded if it refuses.
    pub fn configure(&self, resolution: Resolution, frames: FrameSink) -> Result<(), CaptureError> {
        let (device, generation) = {
            let mut inner = self.shared.lock();
            let device = match (inner.state, inner.device) {
                (SessionState::Open, Some(device)) => device,
                (state, _) => return Err(CaptureError::InvalidState { op: "configure", state }),
            };
            inner.failure = None;
            inner.pending = Some(resolution);
            inner.reader = Some(frames.clone());
            inner.set_state(SessionState::Configuring);
            (device, inner.generation)
        };
        self.shared.changed.notify_all();
        debug!(%resolution, "configuring capture stream");

        let events = EventSink::new(generation, self.events_tx.clone());
        if let Err(err) =
            self.backend
                .start_stream(device, resolution, self.shared.request, events, frames)
        {
            let failure = CaptureError::ConfigureFailed(err.to_string());
            let mut inner = self.shared.lock();
            if inner.generation == generation && inner.state == SessionState::Configuring {
                inner.pending = None;
                if let Some(reader) = inner.reader.take() {
                    reader.close();
                }
                inner.failure = Some(failure.clone());
                inner.set_state(SessionState::Open);
            }
            drop(inner);
            self.shared.changed.notify_all();
            return Err(failure);
        }

        Ok(())
    }

    /// Release the camera. Safe to call at any time and from any state.
    ///
    /// Takes the camera lock without a deadline before looking at the state,
    /// cancelling an `open` still in progress. Teardown failures are logged;
    /// the lock is always released and the session always ends `Closed`.
    pub fn close(&self) {
        let _token = self.claim_lock();

        let teardown = {
            let mut inner = self.shared.lock();
            if inner.state == SessionState::Closed {
                debug!("capture session already closed");
                return;
            }
            inner.generation += 1;
            inner.set_state(SessionState::Closing);
            inner.detach_all()
        };
        self.shared.changed.notify_all();

        teardown.release(&*self.backend);

        self.shared.lock().set_state(SessionState::Closed);
        self.shared.changed.notify_all();
    }

    /// Wait for the camera lock: either the token an `open` parked in the open
    /// window, or the lock itself once whoever holds it lets go.
    fn claim_lock(&self) -> LockToken {
        let mut inner = self.shared.lock();
        loop {
            if let Some(token) = inner.open_window.take() {
                return token;
            }
            if let Some(token) = self.lock.try_acquire() {
                return token;
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, CLOSE_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Block until the session reaches `target`.
    ///
    /// Returns the failure recorded by the latest `open`/`configure` if one
    /// arrives first, or [`CaptureError::Timeout`] once `timeout` elapses.
    pub fn wait_for(&self, target: SessionState, timeout: Duration) -> Result<(), CaptureError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut inner = self.shared.lock();
        loop {
            if inner.state == target {
                return Ok(());
            }
            if let Some(failure) = inner.failure.clone() {
                return Err(failure);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::Timeout {
                    target,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.shared.lock().device
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.shared.lock().stream
    }

    pub fn repeating_request(&self) -> Option<RepeatingRequest> {
        self.shared.lock().request
    }

    /// Failure recorded by the most recent asynchronous transition, if any.
    pub fn last_failure(&self) -> Option<CaptureError> {
        self.shared.lock().failure.clone()
    }

    /// Disconnects and device errors that ended an open session, in order.
    pub fn losses(&self) -> Receiver<CaptureError> {
        self.losses.clone()
    }

    pub fn hardware_lock(&self) -> &HardwareLock {
        &self.lock
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
        let _ = self.events_tx.send(Envelope::Shutdown);
        if let Some(handle) = self.callbacks.take() {
            if handle.join().is_err() {
                error!("capture callback thread panicked");
            }
        }
    }
}

fn spawn_callback_thread(
    shared: Arc<Shared>,
    backend: Arc<dyn CaptureBackend>,
    events: Receiver<Envelope>,
) -> JoinHandle<()> {
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name("capture-callbacks".into())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                while let Ok(envelope) = events.recv() {
                    match envelope {
                        Envelope::Event { generation, event } => {
                            handle_event(&shared, &*backend, generation, event)
                        }
                        Envelope::Shutdown => break,
                    }
                }
            })
        })
        .expect("failed to spawn capture callback thread")
}

fn handle_event(
    shared: &Shared,
    backend: &dyn CaptureBackend,
    generation: u64,
    event: SessionEvent,
) {
    let mut inner = shared.lock();
    if inner.generation != generation {
        drop(inner);
        discard_stale(backend, generation, event);
        return;
    }

    let (teardown, lost) = match event {
        SessionEvent::Opened(device) => (inner.on_opened(device), None),
        SessionEvent::Disconnected(device) => {
            inner.on_lost(device, SessionState::Closed, CaptureError::Disconnected)
        }
        SessionEvent::DeviceError(device, code) => {
            error!(code, "camera device reported an error");
            inner.on_lost(device, SessionState::Error, CaptureError::Device { code })
        }
        SessionEvent::Configured(stream) => (inner.on_configured(stream, shared.request), None),
        SessionEvent::ConfigureFailed(reason) => (inner.on_configure_failed(reason), None),
    };
    drop(inner);
    shared.changed.notify_all();
    teardown.release(backend);
    if let Some(failure) = lost {
        let _ = shared.losses.send(failure);
    }
}

/// Release hardware handed over by a callback from a retired generation.
fn discard_stale(backend: &dyn CaptureBackend, generation: u64, event: SessionEvent) {
    debug!(generation, ?event, "ignoring callback for a retired camera session");
    let teardown = match event {
        SessionEvent::Opened(device) => Teardown {
            device: Some(device),
            ..Teardown::default()
        },
        SessionEvent::Configured(stream) => Teardown {
            stream: Some(stream),
            ..Teardown::default()
        },
        _ => Teardown::default(),
    };
    teardown.release(backend);
}
