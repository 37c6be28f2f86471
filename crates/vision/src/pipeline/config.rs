//! Configuration parsing for the classification pipeline.
//!
//! This module owns translation of CLI arguments into a `PipelineConfig` which
//! the orchestrator uses without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use capture::{
    DEFAULT_LOCK_TIMEOUT_MS, Facing, Illumination, RequestParams, Resolution, SessionOptions,
};
use clap::{Args, ValueEnum};

/// Default bound on waiting for the hardware to confirm an open or configure.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug)]
/// Options supplied once when the pipeline is built.
pub struct PipelineConfig {
    /// Desired inference input size; `None` uses the classifier's own input shape.
    pub target_resolution: Option<Resolution>,
    /// Physical sensor to bind.
    pub camera: Facing,
    /// Max wait for the camera lock in `open`. Expiry is fatal.
    pub lock_timeout_ms: u64,
    /// Max wait for asynchronous open/configure confirmations.
    pub session_timeout_ms: u64,
    /// Repeating request settings.
    pub request: RequestParams,
    /// Log every result and dropped frame.
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_resolution: None,
            camera: Facing::Back,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            request: RequestParams::default(),
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            lock_timeout: self.lock_timeout(),
            request: self.request,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CameraArg {
    Back,
    Front,
}

impl From<CameraArg> for Facing {
    fn from(arg: CameraArg) -> Self {
        match arg {
            CameraArg::Back => Facing::Back,
            CameraArg::Front => Facing::Front,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum IlluminationArg {
    Off,
    Torch,
    AutoFlash,
}

impl From<IlluminationArg> for Illumination {
    fn from(arg: IlluminationArg) -> Self {
        match arg {
            IlluminationArg::Off => Illumination::Off,
            IlluminationArg::Torch => Illumination::Torch,
            IlluminationArg::AutoFlash => Illumination::AutoFlash,
        }
    }
}

/// Pipeline flags shared by every command that streams from a camera.
#[derive(Debug, Args)]
pub struct PipelineCliArgs {
    /// Which sensor to bind.
    #[arg(long = "camera", value_enum, default_value_t = CameraArg::Back)]
    pub camera: CameraArg,
    /// Target inference width in pixels (defaults to the model input).
    #[arg(long = "target-width", value_name = "PX", requires = "target_height")]
    pub target_width: Option<u32>,
    /// Target inference height in pixels (defaults to the model input).
    #[arg(long = "target-height", value_name = "PX", requires = "target_width")]
    pub target_height: Option<u32>,
    /// Max wait for the camera lock before giving up.
    #[arg(long = "lock-timeout-ms", value_name = "MS", default_value_t = DEFAULT_LOCK_TIMEOUT_MS)]
    pub lock_timeout_ms: u64,
    /// Max wait for the camera to confirm open/configure.
    #[arg(long = "session-timeout-ms", value_name = "MS", default_value_t = DEFAULT_SESSION_TIMEOUT_MS)]
    pub session_timeout_ms: u64,
    /// Flash mode applied to every frame.
    #[arg(long = "illumination", value_enum, default_value_t = IlluminationArg::Off)]
    pub illumination: IlluminationArg,
    /// Enable verbose logging (results, frame drops).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<PipelineCliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineCliArgs) -> Result<Self> {
        let target_resolution = match (args.target_width, args.target_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            (None, None) => None,
            (Some(_), Some(_)) => bail!("Target dimensions must be positive integers"),
            (Some(_), None) | (None, Some(_)) => {
                bail!("--target-width and --target-height must be given together")
            }
        };

        if args.lock_timeout_ms == 0 {
            bail!("--lock-timeout-ms must be at least 1");
        }
        if args.session_timeout_ms == 0 {
            bail!("--session-timeout-ms must be at least 1");
        }

        Ok(Self {
            target_resolution,
            camera: args.camera.into(),
            lock_timeout_ms: args.lock_timeout_ms,
            session_timeout_ms: args.session_timeout_ms,
            request: RequestParams {
                illumination: args.illumination.into(),
                ..RequestParams::default()
            },
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use capture::{AutofocusMode, ExposureMode};
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        pipeline: PipelineCliArgs,
    }

    fn parse(args: &[&str]) -> Result<PipelineConfig> {
        let harness = Harness::try_parse_from(std::iter::once("livelabel").chain(args.iter().copied()))?;
        PipelineConfig::try_from(harness.pipeline)
    }

    #[test]
    fn defaults_match_session_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.camera, Facing::Back);
        assert_eq!(config.lock_timeout(), Duration::from_millis(2_500));
        assert_eq!(config.session_timeout_ms, DEFAULT_SESSION_TIMEOUT_MS);
        assert_eq!(config.target_resolution, None);
        assert_eq!(config.request.illumination, Illumination::Off);
        assert_eq!(config.request.autofocus, AutofocusMode::ContinuousPicture);
        assert_eq!(config.request.exposure, ExposureMode::Auto);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--camera",
            "front",
            "--target-width",
            "224",
            "--target-height",
            "224",
            "--illumination",
            "auto-flash",
            "--lock-timeout-ms",
            "100",
        ])
        .unwrap();
        assert_eq!(config.camera, Facing::Front);
        assert_eq!(config.target_resolution, Some(Resolution::new(224, 224)));
        assert_eq!(config.request.illumination, Illumination::AutoFlash);
        assert_eq!(config.session_options().lock_timeout, Duration::from_millis(100));
    }

    #[test]
    fn rejects_zero_sizes_and_timeouts() {
        assert!(parse(&["--target-width", "0", "--target-height", "10"]).is_err());
        assert!(parse(&["--lock-timeout-ms", "0"]).is_err());
        assert!(parse(&["--session-timeout-ms", "0"]).is_err());
    }

    #[test]
    fn target_dimensions_come_in_pairs() {
        assert!(parse(&["--target-width", "224"]).is_err());
    }
}
