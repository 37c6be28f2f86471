//! OpenCV-backed camera hardware.
//!
//! Each configured device maps a facing to a `VideoCapture` URI or index. A
//! bound device keeps its `VideoCapture` open; a stream moves it onto a reader
//! thread and hands it back when stopped.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use capture::{
    AutofocusMode, CaptureBackend, CaptureError, DeviceHandle, EventSink, ExposureMode, Frame,
    FrameFormat, FrameSink, Illumination, Orientation, RequestParams, Resolution, SensorInfo,
    StreamHandle,
};
use opencv::{
    core::{Mat, MatTraitConst, MatTraitConstManual},
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};
use vision::telemetry;

use crate::cli::DeviceSpec;

/// Sizes offered to each camera when probing what it supports.
const CANDIDATE_SIZES: [(u32, u32); 8] = [
    (176, 144),
    (320, 240),
    (640, 480),
    (800, 600),
    (1024, 768),
    (1280, 720),
    (1600, 1200),
    (1920, 1080),
];

fn backend_error(err: opencv::Error) -> CaptureError {
    CaptureError::Backend(err.to_string())
}

struct Bound {
    uri: String,
    capture: Option<VideoCapture>,
}

struct Stream {
    device: u64,
    running: Arc<AtomicBool>,
    reader: thread::JoinHandle<VideoCapture>,
}

#[derive(Default)]
struct Devices {
    bound: HashMap<u64, Bound>,
    streams: HashMap<u64, Stream>,
}

pub struct OpenCvBackend {
    devices: Vec<DeviceSpec>,
    orientation: Orientation,
    state: Mutex<Devices>,
    next_handle: AtomicU64,
}

impl OpenCvBackend {
    pub fn new(devices: Vec<DeviceSpec>, orientation: Orientation) -> Self {
        Self {
            devices,
            orientation,
            state: Mutex::new(Devices::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, Devices> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn stop_stream(stream: Stream) -> Result<VideoCapture, CaptureError> {
        stream.running.store(false, Ordering::SeqCst);
        stream
            .reader
            .join()
            .map_err(|_| CaptureError::Backend("capture reader thread panicked".into()))
    }
}

impl CaptureBackend for OpenCvBackend {
    fn enumerate_sensors(&self) -> Result<Vec<SensorInfo>, CaptureError> {
        let mut sensors = Vec::with_capacity(self.devices.len());
        for spec in &self.devices {
            let supported = match open_video_capture(&spec.uri) {
                Ok(mut cap) => detect_resolutions(&mut cap),
                Err(err) => {
                    warn!(uri = %spec.uri, "skipping camera: {err}");
                    continue;
                }
            };
            sensors.push(SensorInfo {
                id: spec.uri.clone(),
                facing: spec.facing,
                orientation: self.orientation,
                supported,
            });
        }
        Ok(sensors)
    }

    fn bind(&self, id: &str, events: EventSink) -> Result<(), CaptureError> {
        let capture = open_video_capture(id)?;
        let handle = self.handle();
        self.state().bound.insert(
            handle,
            Bound {
                uri: id.to_string(),
                capture: Some(capture),
            },
        );
        events.opened(DeviceHandle(handle));
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
        let mut state = self.state();
        let bound = state
            .bound
            .get_mut(&device.0)
            .ok_or_else(|| CaptureError::Backend(format!("unknown device {}", device.0)))?;
        let Some(mut cap) = bound.capture.take() else {
            return Err(CaptureError::Backend(format!(
                "{} is already streaming",
                bound.uri
            )));
        };

        let actual = match apply_request(&mut cap, resolution, params) {
            Ok(actual) => actual,
            Err(err) => {
                bound.capture = Some(cap);
                return Err(err);
            }
        };
        if actual != resolution {
            bound.capture = Some(cap);
            events.configure_failed(format!(
                "{} delivers {actual}, {resolution} was requested",
                bound.uri
            ));
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let running = running.clone();
            telemetry::spawn_thread("capture-stream", move || {
                read_frames(&mut cap, resolution, &running, &frames);
                cap
            })
            .map_err(|err| CaptureError::Backend(format!("failed to spawn reader: {err}")))?
        };

        let stream = self.handle();
        state.streams.insert(
            stream,
            Stream {
                device: device.0,
                running,
                reader,
            },
        );
        drop(state);
        events.configured(StreamHandle(stream));
        Ok(())
    }

    fn stop(&self, stream: StreamHandle) -> Result<(), CaptureError> {
        let Some(entry) = self.state().streams.remove(&stream.0) else {
            return Err(CaptureError::Backend(format!("unknown stream {}", stream.0)));
        };
        let device = entry.device;
        let cap = Self::stop_stream(entry)?;
        if let Some(bound) = self.state().bound.get_mut(&device) {
            bound.capture = Some(cap);
        }
        Ok(())
    }

    fn unbind(&self, device: DeviceHandle) -> Result<(), CaptureError> {
        let (bound, orphans) = {
            let mut state = self.state();
            let orphans: Vec<u64> = state
                .streams
                .iter()
                .filter(|(_, stream)| stream.device == device.0)
                .map(|(id, _)| *id)
                .collect();
            let orphans: Vec<Stream> = orphans
                .into_iter()
                .filter_map(|id| state.streams.remove(&id))
                .collect();
            (state.bound.remove(&device.0), orphans)
        };
        for stream in orphans {
            Self::stop_stream(stream)?;
        }
        match bound {
            Some(bound) => {
                debug!(uri = %bound.uri, "camera released");
                Ok(())
            }
            None => Err(CaptureError::Backend(format!("unknown device {}", device.0))),
        }
    }
}

/// Reader loop executed on the stream thread.
fn read_frames(
    cap: &mut VideoCapture,
    resolution: Resolution,
    running: &AtomicBool,
    frames: &FrameSink,
) {
    let mut mat = Mat::default();
    while running.load(Ordering::SeqCst) && frames.is_active() {
        match cap.read(&mut mat) {
            Ok(true) if !mat.empty() => match mat.data_bytes() {
                Ok(bytes) => {
                    frames.deliver(Ok(Frame::new(bytes.to_vec(), resolution, FrameFormat::Bgr8)))
                }
                Err(err) => frames.deliver(Err(CaptureError::FrameAcquisitionFailed(
                    err.to_string(),
                ))),
            },
            Ok(_) => thread::sleep(Duration::from_millis(5)),
            Err(err) => {
                frames.deliver(Err(CaptureError::FrameAcquisitionFailed(err.to_string())));
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
fn parse_device_index(uri: &str) -> Option<i32> {
    uri.parse::<i32>().ok().or_else(|| {
        uri.strip_prefix("/dev/video")
            .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .and_then(|rest| rest.parse().ok())
    })
}

/// Open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        let opened = match parse_device_index(uri) {
            Some(index) => VideoCapture::new(index, backend),
            None => VideoCapture::from_file(uri, backend),
        };
        match opened {
            Ok(cap) => {
                if cap.is_opened().map_err(backend_error)? {
                    return Ok(cap);
                }
                debug!(uri, backend, "camera did not open");
            }
            Err(err) => debug!(uri, backend, "failed to open camera: {err}"),
        }
    }
    Err(CaptureError::Backend(format!("cannot open camera {uri}")))
}

fn current_size(cap: &VideoCapture) -> Result<Resolution, CaptureError> {
    let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).map_err(backend_error)?;
    let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).map_err(backend_error)?;
    Ok(Resolution::new(width.max(0.0) as u32, height.max(0.0) as u32))
}

/// Sizes the camera accepts, in ascending area, as reported back by the driver.
fn detect_resolutions(cap: &mut VideoCapture) -> Vec<Resolution> {
    let mut supported: Vec<Resolution> = Vec::new();
    for (width, height) in CANDIDATE_SIZES {
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(width));
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(height));
        match current_size(cap) {
            Ok(size) if !size.is_empty() && !supported.contains(&size) => supported.push(size),
            Ok(_) => {}
            Err(err) => warn!("resolution check failed: {err}"),
        }
    }
    supported.sort_by_key(|size| size.area());
    supported
}

/// Apply the repeating request and return the size the driver settled on.
fn apply_request(
    cap: &mut VideoCapture,
    resolution: Resolution,
    params: RequestParams,
) -> Result<Resolution, CaptureError> {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, f64::from(mjpg));
    }
    cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(resolution.width))
        .map_err(backend_error)?;
    cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(resolution.height))
        .map_err(backend_error)?;

    let autofocus = matches!(params.autofocus, AutofocusMode::ContinuousPicture);
    let _ = cap.set(videoio::CAP_PROP_AUTOFOCUS, if autofocus { 1.0 } else { 0.0 });
    // V4L2 auto exposure: 3 = aperture priority (auto), 1 = manual.
    let exposure = match params.exposure {
        ExposureMode::Auto => 3.0,
        ExposureMode::Off => 1.0,
    };
    let _ = cap.set(videoio::CAP_PROP_AUTO_EXPOSURE, exposure);
    if params.illumination != Illumination::Off {
        debug!(illumination = ?params.illumination, "camera has no flash control, ignoring");
    }

    current_size(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_indices_parse_from_numbers_and_paths() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video3"), Some(3));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }
}
