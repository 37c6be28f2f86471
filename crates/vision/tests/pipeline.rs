use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use capture::{
    CaptureBackend, CaptureError, Facing, Frame, Orientation, Resolution, SensorInfo,
    SessionState,
    testing::{BackendCall, BindOutcome, ScriptedBackend, StreamOutcome, test_frame},
};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use image::RgbImage;
use ml_core::{
    ClassificationResult, Classifier, EngineError, InferenceEngine, InputShape, InputTensor,
    ModelHandle, OutputDistribution,
};
use vision::{
    AffineMatrix, ConvertError, DisplaySink, FrameConverter, PackedConverter, Pipeline,
    PipelineConfig, PipelineError, compute_transform,
};

const WAIT: Duration = Duration::from_secs(2);
const FRAME: Resolution = Resolution::new(8, 6);

type Output = Result<OutputDistribution, String>;

/// Engine whose every `run` blocks until the test hands it an output.
struct ScriptedEngine {
    outputs: Receiver<Output>,
    started: Sender<()>,
    unloaded: Arc<AtomicUsize>,
}

impl InferenceEngine for ScriptedEngine {
    fn load_model(&mut self, _path: &Path) -> Result<ModelHandle, EngineError> {
        Ok(ModelHandle(1))
    }

    fn input_shape(&self, _model: ModelHandle) -> Result<InputShape, EngineError> {
        Ok(InputShape {
            size: Resolution::new(4, 4),
            channels: 3,
        })
    }

    fn run(
        &mut self,
        _model: ModelHandle,
        _input: &InputTensor,
    ) -> Result<OutputDistribution, EngineError> {
        let _ = self.started.send(());
        match self.outputs.recv_timeout(WAIT) {
            Ok(output) => output.map_err(EngineError::Run),
            Err(_) => Err(EngineError::Run("no scripted output".into())),
        }
    }

    fn unload(&mut self, _model: ModelHandle) {
        self.unloaded.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordingConverter {
    orientations: Arc<Mutex<Vec<Orientation>>>,
    crash: Arc<AtomicBool>,
}

impl FrameConverter for RecordingConverter {
    fn convert(&mut self, frame: &Frame, out: &mut RgbImage) -> Result<(), ConvertError> {
        if self.crash.load(Ordering::SeqCst) {
            panic!("converter crashed");
        }
        self.orientations.lock().unwrap().push(frame.orientation);
        PackedConverter.convert(frame, out)
    }
}

struct RecordingSink {
    results: Sender<ClassificationResult>,
    transforms: Mutex<Vec<AffineMatrix>>,
}

impl DisplaySink for RecordingSink {
    fn publish_result(&self, result: &ClassificationResult) {
        let _ = self.results.send(result.clone());
    }

    fn publish_transform(&self, transform: &AffineMatrix) {
        self.transforms.lock().unwrap().push(*transform);
    }
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    outputs: Sender<Output>,
    started: Receiver<()>,
    results: Receiver<ClassificationResult>,
    sink: Arc<RecordingSink>,
    unloaded: Arc<AtomicUsize>,
    orientations: Arc<Mutex<Vec<Orientation>>>,
    crash: Arc<AtomicBool>,
}

impl Harness {
    fn new(sensors: Vec<SensorInfo>) -> Self {
        let (outputs, _) = unbounded();
        let (_, started) = unbounded();
        let (results_tx, results) = unbounded();
        Self {
            backend: Arc::new(ScriptedBackend::new(sensors)),
            outputs,
            started,
            results,
            sink: Arc::new(RecordingSink {
                results: results_tx,
                transforms: Mutex::new(Vec::new()),
            }),
            unloaded: Arc::new(AtomicUsize::new(0)),
            orientations: Arc::new(Mutex::new(Vec::new())),
            crash: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open(&mut self, config: PipelineConfig) -> Result<Pipeline, PipelineError> {
        let (outputs_tx, outputs_rx) = unbounded();
        let (started_tx, started_rx) = unbounded();
        self.outputs = outputs_tx;
        self.started = started_rx;
        let engine = ScriptedEngine {
            outputs: outputs_rx,
            started: started_tx,
            unloaded: self.unloaded.clone(),
        };
        let classifier = Classifier::load(Box::new(engine), Path::new("model.pt")).unwrap();
        let converter = RecordingConverter {
            orientations: self.orientations.clone(),
            crash: self.crash.clone(),
        };
        Pipeline::open(
            self.backend.clone() as Arc<dyn CaptureBackend>,
            classifier,
            Box::new(converter),
            self.sink.clone(),
            config,
        )
    }

    fn streaming(&mut self) -> Pipeline {
        let pipeline = self.open(config()).unwrap();
        pipeline.configure().unwrap();
        pipeline
    }
}

fn back_sensor(orientation: Orientation) -> SensorInfo {
    SensorInfo {
        id: "0".into(),
        facing: Facing::Back,
        orientation,
        supported: vec![Resolution::new(16, 12), FRAME],
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        session_timeout_ms: 1_000,
        ..PipelineConfig::default()
    }
}

fn output(entries: &[(&str, f32)]) -> Output {
    Ok(entries
        .iter()
        .map(|(label, score)| (label.to_string(), *score))
        .collect())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn frames_arriving_while_busy_are_dropped_and_released() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    assert_eq!(pipeline.state(), SessionState::Streaming);
    assert_eq!(pipeline.resolution(), FRAME);

    let admitted = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    assert!(harness.backend.push_frame(test_frame(FRAME, &admitted)));
    harness.started.recv_timeout(WAIT).unwrap();

    for _ in 0..3 {
        assert!(harness.backend.push_frame(test_frame(FRAME, &dropped)));
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 3);
    assert!(pipeline.gate().is_busy());

    harness.outputs.send(output(&[("cat", 0.2), ("dog", 0.8)])).unwrap();
    let result = harness.results.recv_timeout(WAIT).unwrap();
    assert_eq!(result.label, "dog");
    assert_eq!(pipeline.latest_result(), Some(result));
    assert!(wait_until(|| !pipeline.gate().is_busy()));
    assert_eq!(admitted.load(Ordering::SeqCst), 1);

    // Only the admitted frame produced a result.
    assert!(harness.results.try_recv().is_err());
}

#[test]
fn engine_failure_discards_result_and_frees_the_gate() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    let released = Arc::new(AtomicUsize::new(0));

    harness.outputs.send(Err("delegate crashed".into())).unwrap();
    assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
    assert!(wait_until(|| released.load(Ordering::SeqCst) == 1
        && !pipeline.gate().is_busy()));
    assert_eq!(pipeline.latest_result(), None);

    harness.outputs.send(output(&[("eel", 0.9)])).unwrap();
    assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
    let result = harness.results.recv_timeout(WAIT).unwrap();
    assert_eq!(result.label, "eel");
    assert!(wait_until(|| released.load(Ordering::SeqCst) == 2));
}

#[test]
fn acquisition_failures_do_not_disturb_the_next_frame() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    let released = Arc::new(AtomicUsize::new(0));

    assert!(harness.backend.push_acquisition_failure("out of buffers"));
    assert!(!pipeline.gate().is_busy());

    harness.outputs.send(output(&[("owl", 0.5)])).unwrap();
    assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
    assert_eq!(harness.results.recv_timeout(WAIT).unwrap().label, "owl");
}

#[test]
fn frames_carry_orientation_relative_to_the_display() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg90)]);
    let pipeline = harness.streaming();
    let released = Arc::new(AtomicUsize::new(0));

    for (display, scores) in [
        (Orientation::Deg0, output(&[("a", 1.0)])),
        (Orientation::Deg90, output(&[("b", 1.0)])),
        (Orientation::Deg270, output(&[("c", 1.0)])),
    ] {
        pipeline.set_display_rotation(display);
        harness.outputs.send(scores).unwrap();
        assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
        harness.results.recv_timeout(WAIT).unwrap();
        assert!(wait_until(|| !pipeline.gate().is_busy()));
    }

    assert_eq!(
        *harness.orientations.lock().unwrap(),
        vec![Orientation::Deg90, Orientation::Deg0, Orientation::Deg180]
    );
}

#[test]
fn view_resize_publishes_the_preview_transform() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg90)]);
    let pipeline = harness.streaming();
    let view = Resolution::new(1200, 1600);

    let transform = pipeline.on_view_resized(view, Orientation::Deg270);
    assert_eq!(transform, compute_transform(view, FRAME, Orientation::Deg270));
    assert_eq!(pipeline.display_rotation(), Orientation::Deg270);
    assert_eq!(*harness.sink.transforms.lock().unwrap(), vec![transform]);
}

#[test]
fn refused_configuration_can_be_retried() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    harness
        .backend
        .set_stream_outcome(StreamOutcome::Fail("surface gone".into()));
    let pipeline = harness.open(config()).unwrap();

    let err = pipeline.configure().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::ConfigureFailed(_))
    ));
    assert!(!err.is_fatal());
    assert_eq!(pipeline.state(), SessionState::Open);

    harness.backend.set_stream_outcome(StreamOutcome::Configure);
    pipeline.configure().unwrap();
    assert_eq!(pipeline.state(), SessionState::Streaming);
}

#[test]
fn missing_resolutions_close_the_camera() {
    let mut sensor = back_sensor(Orientation::Deg0);
    sensor.supported.clear();
    let mut harness = Harness::new(vec![sensor]);

    let err = harness.open(config()).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::NoCompatibleResolution)
    ));
    assert!(err.is_fatal());
    assert!(
        harness
            .backend
            .calls()
            .iter()
            .any(|call| matches!(call, BackendCall::Unbind(_)))
    );
    assert_eq!(harness.unloaded.load(Ordering::SeqCst), 1);
}

#[test]
fn unanswered_open_times_out() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    harness.backend.set_bind_outcome(BindOutcome::Hang);

    let err = harness
        .open(PipelineConfig {
            session_timeout_ms: 50,
            ..PipelineConfig::default()
        })
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::Timeout {
            target: SessionState::Open,
            ..
        })
    ));
    assert!(err.is_fatal());
    assert_eq!(harness.unloaded.load(Ordering::SeqCst), 1);
    assert!(
        !harness
            .backend
            .calls()
            .iter()
            .any(|call| matches!(call, BackendCall::StartStream(..)))
    );
}

#[test]
fn missing_sensor_is_reported() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let err = harness
        .open(PipelineConfig {
            camera: Facing::Front,
            ..config()
        })
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::NoSensor(Facing::Front))
    ));
}

#[test]
fn stopping_closes_the_camera_and_unloads_the_model() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let mut pipeline = harness.streaming();

    pipeline.stop();
    assert_eq!(pipeline.state(), SessionState::Closed);
    assert_eq!(harness.unloaded.load(Ordering::SeqCst), 1);

    let released = Arc::new(AtomicUsize::new(0));
    assert!(!harness.backend.push_frame(test_frame(FRAME, &released)));
    assert_eq!(released.load(Ordering::SeqCst), 1);

    pipeline.stop();
    drop(pipeline);
    assert_eq!(harness.unloaded.load(Ordering::SeqCst), 1);
}

#[test]
fn camera_lost_while_streaming_ends_supervision_with_the_failure() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    let (_shutdown_tx, shutdown) = bounded::<()>(1);

    assert!(harness.backend.fail_device(7));
    let err = pipeline.supervise(&shutdown, Some(WAIT)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::Device { code: 7 })
    ));
    assert!(err.is_fatal());
    assert_eq!(pipeline.state(), SessionState::Error);
}

#[test]
fn supervision_ends_cleanly_on_shutdown_or_time_limit() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    let (shutdown_tx, shutdown) = bounded::<()>(1);

    let started = Instant::now();
    pipeline
        .supervise(&shutdown, Some(Duration::from_millis(20)))
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));

    shutdown_tx.send(()).unwrap();
    pipeline.supervise(&shutdown, None).unwrap();
    assert_eq!(pipeline.state(), SessionState::Streaming);
}

#[test]
fn worker_panic_is_reported_and_later_frames_are_released() {
    let mut harness = Harness::new(vec![back_sensor(Orientation::Deg0)]);
    let pipeline = harness.streaming();
    let (_shutdown_tx, shutdown) = bounded::<()>(1);
    let released = Arc::new(AtomicUsize::new(0));

    harness.crash.store(true, Ordering::SeqCst);
    assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
    let err = pipeline.supervise(&shutdown, Some(WAIT)).unwrap_err();
    assert!(matches!(err, PipelineError::WorkerPanicked));
    assert!(err.is_fatal());
    assert!(wait_until(|| released.load(Ordering::SeqCst) == 1
        && !pipeline.gate().is_busy()));

    assert!(harness.backend.push_frame(test_frame(FRAME, &released)));
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert!(!pipeline.gate().is_busy());
}
