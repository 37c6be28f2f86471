use std::fmt;

use chrono::Utc;
use thiserror::Error;

/// Pixel dimensions of a sensor output or a display surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, widened so large sensors cannot overflow.
    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Same rectangle with width and height exchanged.
    pub fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Quarter-turn rotation of the device relative to the sensor's natural orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Normalise any multiple of 90 degrees (negative values included) into `[0, 360)`.
    ///
    /// Returns `None` for angles that are not a quarter turn.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Orientation::Deg0),
            90 => Some(Orientation::Deg90),
            180 => Some(Orientation::Deg180),
            270 => Some(Orientation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        self.quarter_turns() as i32 * 90
    }

    /// Rotation code as reported by display services: 0°→0, 90°→1, 180°→2, 270°→3.
    pub fn quarter_turns(self) -> u8 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 1,
            Orientation::Deg180 => 2,
            Orientation::Deg270 => 3,
        }
    }

    pub fn from_quarter_turns(turns: u8) -> Self {
        match turns % 4 {
            0 => Orientation::Deg0,
            1 => Orientation::Deg90,
            2 => Orientation::Deg180,
            _ => Orientation::Deg270,
        }
    }

    /// Orientation of sensor content as seen on a display rotated by `display`.
    pub fn relative(sensor: Orientation, display: Orientation) -> Orientation {
        Self::from_quarter_turns((4 + sensor.quarter_turns() - display.quarter_turns()) % 4)
    }

    /// True when width and height trade places on screen.
    pub fn is_sideways(self) -> bool {
        matches!(self, Orientation::Deg90 | Orientation::Deg270)
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Which way a physical sensor points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Facing {
    Front,
    Back,
    External,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Facing::Front => "front",
            Facing::Back => "back",
            Facing::External => "external",
        };
        f.write_str(label)
    }
}

/// Static description of a sensor as reported by the hardware backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorInfo {
    pub id: String,
    pub facing: Facing,
    /// Fixed mounting rotation of the sensor.
    pub orientation: Orientation,
    pub supported: Vec<Resolution>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Rgb8,
    Bgr8,
    Rgba8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 | FrameFormat::Bgr8 => 3,
            FrameFormat::Rgba8 => 4,
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Decoded sensor buffer.
///
/// A frame may carry a release hook that hands the underlying buffer back to the
/// hardware backend. The hook runs exactly once, when the frame is dropped or
/// explicitly released, whichever stage happens to own it at that point.
pub struct Frame {
    pub data: Vec<u8>,
    pub resolution: Resolution,
    pub format: FrameFormat,
    /// Rotation needed to show the content upright, valid at capture time.
    pub orientation: Orientation,
    pub timestamp_ms: i64,
    release: Option<ReleaseFn>,
}

impl Frame {
    pub fn new(data: Vec<u8>, resolution: Resolution, format: FrameFormat) -> Self {
        Self {
            data,
            resolution,
            format,
            orientation: Orientation::Deg0,
            timestamp_ms: Utc::now().timestamp_millis(),
            release: None,
        }
    }

    /// Attach a hook that returns the buffer to its producer.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Hand the buffer back to its producer now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("format", &self.format)
            .field("orientation", &self.orientation)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("timed out after {timeout_ms} ms waiting to lock the camera")]
    LockTimeout { timeout_ms: u64 },
    #[error("stream configuration rejected: {0}")]
    ConfigureFailed(String),
    #[error("sensor reported no usable output resolution")]
    NoCompatibleResolution,
    #[error("could not acquire frame: {0}")]
    FrameAcquisitionFailed(String),
    #[error("no {0} camera available")]
    NoSensor(Facing),
    #[error("cannot {op} while session is {state}")]
    InvalidState {
        op: &'static str,
        state: crate::SessionState,
    },
    #[error("camera disconnected")]
    Disconnected,
    #[error("camera device error {code}")]
    Device { code: i32 },
    #[error("timed out after {waited_ms} ms waiting for the session to become {target}")]
    Timeout {
        target: crate::SessionState,
        waited_ms: u64,
    },
    #[error("camera open cancelled by close")]
    Cancelled,
    #[error("capture backend: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn area_does_not_overflow_32_bits() {
        let huge = Resolution::new(100_000, 100_000);
        assert_eq!(huge.area(), 10_000_000_000);
    }

    #[test]
    fn orientation_normalises_wraparound() {
        assert_eq!(Orientation::from_degrees(-90), Some(Orientation::Deg270));
        assert_eq!(Orientation::from_degrees(450), Some(Orientation::Deg90));
        assert_eq!(Orientation::from_degrees(360), Some(Orientation::Deg0));
        assert_eq!(Orientation::from_degrees(45), None);
    }

    #[test]
    fn relative_orientation_subtracts_display_rotation() {
        use Orientation::*;
        assert_eq!(Orientation::relative(Deg90, Deg0), Deg90);
        assert_eq!(Orientation::relative(Deg90, Deg90), Deg0);
        assert_eq!(Orientation::relative(Deg90, Deg270), Deg180);
        assert_eq!(Orientation::relative(Deg0, Deg90), Deg270);
    }

    #[test]
    fn frame_release_hook_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::new(vec![0; 3], Resolution::new(1, 1), FrameFormat::Rgb8)
            .with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        frame.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
