//! Orchestrator that drives sensor frames through admission and inference.
//!
//! Frames arrive on the capture backend's delivery context. Each one either
//! claims the [`FrameGate`] and is handed to the inference worker, or is
//! released on the spot; delivery never waits on inference. The worker owns the
//! classifier, the frame converter, and a single reusable RGB buffer.

pub mod config;
pub mod telemetry;

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use capture::{
    CaptureBackend, CaptureSession, Frame, FrameSink, Orientation, Resolution, SensorInfo,
    SessionState, select_optimal,
};
use crossbeam_channel::{Receiver, Sender, TrySendError, after, bounded, never, select, unbounded};
use image::RgbImage;
use ml_core::{ClassificationResult, Classifier};
use tracing::{debug, error, info_span, warn};

use crate::{
    convert::FrameConverter,
    error::PipelineError,
    gate::{Admission, FrameGate},
    sink::DisplaySink,
    transform::{AffineMatrix, compute_transform},
};

use self::config::PipelineConfig;

type LatestResult = Arc<Mutex<Option<ClassificationResult>>>;

/// Admitted frame on its way to the worker. Dropping it, on any path,
/// releases the frame and frees the gate.
struct FrameTask {
    frame: Frame,
    admission: Admission,
}

/// A camera bound to a classifier.
///
/// Built with [`Pipeline::open`]; frames flow once [`Pipeline::configure`]
/// succeeds. Dropping the pipeline closes the camera and stops the worker.
pub struct Pipeline {
    session: CaptureSession,
    sensor: SensorInfo,
    resolution: Resolution,
    config: PipelineConfig,
    gate: Arc<FrameGate>,
    sink: Arc<dyn DisplaySink>,
    latest: LatestResult,
    display_rotation: Arc<AtomicU8>,
    tasks: Sender<FrameTask>,
    stop: Option<Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
    worker_exits: Receiver<PipelineError>,
}

impl Pipeline {
    /// Open the configured camera, pick its output size, and start the
    /// inference worker.
    ///
    /// [`capture::CaptureError::LockTimeout`] and
    /// [`capture::CaptureError::NoCompatibleResolution`] are returned as-is; the
    /// camera is closed before returning on any failure.
    pub fn open(
        backend: Arc<dyn CaptureBackend>,
        classifier: Classifier,
        converter: Box<dyn FrameConverter>,
        sink: Arc<dyn DisplaySink>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let span = info_span!(
            "pipeline.open",
            camera = %config.camera,
            lock_timeout_ms = config.lock_timeout_ms,
            resolution = tracing::field::Empty
        );
        let _span_guard = span.enter();

        let session = CaptureSession::new(backend, config.session_options());
        let sensor = session.open(config.camera)?;
        if let Err(err) = session.wait_for(SessionState::Open, config.session_timeout()) {
            session.close();
            return Err(err.into());
        }

        let target = config
            .target_resolution
            .unwrap_or_else(|| classifier.input_size());
        let resolution = match select_optimal(&sensor.supported, target.width, target.height) {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(sensor = %sensor.id, "{err}");
                session.close();
                return Err(err.into());
            }
        };
        span.record("resolution", tracing::field::display(resolution));
        debug!(sensor = %sensor.id, %target, %resolution, "selected stream size");

        let latest: LatestResult = Arc::new(Mutex::new(None));
        let (tasks_tx, tasks_rx) = bounded::<FrameTask>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (exits_tx, worker_exits) = unbounded();
        let worker = InferenceWorker {
            classifier,
            converter,
            buffer: RgbImage::new(0, 0),
            sink: sink.clone(),
            latest: latest.clone(),
            verbose: config.verbose,
        };
        let worker = match telemetry::spawn_thread("inference-worker", move || {
            worker.run(tasks_rx, stop_rx, exits_tx)
        }) {
            Ok(handle) => handle,
            Err(err) => {
                session.close();
                return Err(PipelineError::Worker(err));
            }
        };

        Ok(Self {
            session,
            sensor,
            resolution,
            config,
            gate: Arc::new(FrameGate::new()),
            sink,
            latest,
            display_rotation: Arc::new(AtomicU8::new(0)),
            tasks: tasks_tx,
            stop: Some(stop_tx),
            worker: Some(worker),
            worker_exits,
        })
    }

    /// Start streaming at the selected size and wait for the camera to confirm.
    ///
    /// A refused configuration leaves the camera open and not streaming; call
    /// again to retry.
    pub fn configure(&self) -> Result<(), PipelineError> {
        self.session.configure(self.resolution, self.frame_sink())?;
        self.session
            .wait_for(SessionState::Streaming, self.config.session_timeout())?;
        debug!(resolution = %self.resolution, "pipeline streaming");
        Ok(())
    }

    /// Block while the pipeline streams.
    ///
    /// Returns `Ok` once `shutdown` fires or `limit` elapses, and the fatal
    /// error if the camera is lost or the inference worker dies first.
    pub fn supervise(
        &self,
        shutdown: &Receiver<()>,
        limit: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let losses = self.session.losses();
        let deadline = limit.map(after).unwrap_or_else(never);
        select! {
            recv(shutdown) -> _ => Ok(()),
            recv(deadline) -> _ => Ok(()),
            recv(losses) -> lost => match lost {
                Ok(err) => {
                    error!(sensor = %self.sensor.id, "camera lost while streaming: {err}");
                    Err(err.into())
                }
                Err(_) => Ok(()),
            },
            recv(self.worker_exits) -> exit => match exit {
                Ok(err) => Err(err),
                Err(_) => Ok(()),
            },
        }
    }

    /// Close the camera and stop the inference worker. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.session.close();
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("inference worker panicked");
            }
        }
    }

    /// Record a new display rotation, recompute the preview transform for
    /// `view`, and publish it.
    pub fn on_view_resized(&self, view: Resolution, rotation: Orientation) -> AffineMatrix {
        self.set_display_rotation(rotation);
        let transform = compute_transform(view, self.resolution, rotation);
        self.sink.publish_transform(&transform);
        transform
    }

    /// Display rotation applied to frames delivered from now on.
    pub fn set_display_rotation(&self, rotation: Orientation) {
        self.display_rotation
            .store(rotation.quarter_turns(), Ordering::Release);
    }

    pub fn display_rotation(&self) -> Orientation {
        Orientation::from_quarter_turns(self.display_rotation.load(Ordering::Acquire))
    }

    /// Most recent result; older results are overwritten, never queued.
    pub fn latest_result(&self) -> Option<ClassificationResult> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sensor(&self) -> &SensorInfo {
        &self.sensor
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    fn frame_sink(&self) -> FrameSink {
        let gate = self.gate.clone();
        let tasks = self.tasks.clone();
        let rotation = self.display_rotation.clone();
        let sensor = self.sensor.orientation;
        let verbose = self.config.verbose;
        FrameSink::new(move |delivered| match delivered {
            Ok(frame) => {
                let display = Orientation::from_quarter_turns(rotation.load(Ordering::Acquire));
                let orientation = Orientation::relative(sensor, display);
                dispatch_frame(frame, &gate, &tasks, orientation, verbose);
            }
            Err(err) => {
                metrics::counter!("pipeline_frame_acquisition_failures_total").increment(1);
                warn!("frame acquisition failed: {err}");
            }
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Admit `frame` or release it immediately. Never blocks.
fn dispatch_frame(
    frame: Frame,
    gate: &Arc<FrameGate>,
    tasks: &Sender<FrameTask>,
    orientation: Orientation,
    verbose: bool,
) {
    metrics::counter!("pipeline_frames_total").increment(1);
    let Some(admission) = gate.admit() else {
        metrics::counter!("pipeline_frames_dropped_total").increment(1);
        if verbose {
            debug!("inference busy, dropping frame");
        }
        frame.release();
        return;
    };

    let task = FrameTask {
        frame: frame.with_orientation(orientation),
        admission,
    };
    if let Err(err) = tasks.try_send(task) {
        metrics::counter!("pipeline_frames_dropped_total").increment(1);
        match err {
            TrySendError::Full(_) => warn!("inference queue unexpectedly full, dropping frame"),
            TrySendError::Disconnected(_) => error!("inference worker gone, dropping frame"),
        }
    }
}

struct InferenceWorker {
    classifier: Classifier,
    converter: Box<dyn FrameConverter>,
    buffer: RgbImage,
    sink: Arc<dyn DisplaySink>,
    latest: LatestResult,
    verbose: bool,
}

/// Reports a worker that unwinds instead of returning.
struct ExitReport(Sender<PipelineError>);

impl Drop for ExitReport {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("inference worker panicked; no further frames will be classified");
            let _ = self.0.send(PipelineError::WorkerPanicked);
        }
    }
}

impl InferenceWorker {
    fn run(
        mut self,
        tasks: Receiver<FrameTask>,
        stop: Receiver<()>,
        exits: Sender<PipelineError>,
    ) {
        let _report = ExitReport(exits);
        // Rebound after the report so both receivers close before it is sent.
        let (tasks, stop) = (tasks, stop);
        loop {
            select! {
                recv(tasks) -> task => match task {
                    Ok(task) => self.process(task),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        debug!("inference worker stopped");
    }

    fn process(&mut self, task: FrameTask) {
        let FrameTask { frame, admission } = task;
        let orientation = frame.orientation;
        let _span_guard = info_span!(
            "inference",
            width = frame.resolution.width,
            height = frame.resolution.height,
            orientation = orientation.degrees()
        )
        .entered();

        let converted = self.converter.convert(&frame, &mut self.buffer);
        frame.release();
        if let Err(err) = converted {
            metrics::counter!("pipeline_frame_acquisition_failures_total").increment(1);
            warn!("frame conversion failed: {err}");
            return;
        }

        let started = Instant::now();
        let outcome = self.classifier.classify(&self.buffer, orientation);
        metrics::histogram!("pipeline_inference_latency_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                if self.verbose {
                    debug!(label = %result.label, confidence = result.confidence, "classified frame");
                }
                *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
                self.sink.publish_result(&result);
            }
            Err(err) => {
                metrics::counter!("pipeline_inference_errors_total").increment(1);
                warn!("inference failed, discarding frame: {err}");
            }
        }
        drop(admission);
    }
}
