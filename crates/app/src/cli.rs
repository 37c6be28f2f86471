use std::path::PathBuf;

use capture::{Facing, Orientation, Resolution};
use clap::{Args, Parser, Subcommand};
use vision::PipelineCliArgs;

/// Live camera classification.
#[derive(Debug, Parser)]
#[command(name = "livelabel", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream from a camera and print the most likely label for each classified frame.
    Run(RunArgs),
    /// Describe the configured cameras and the stream size each would use.
    Sensors(SensorsArgs),
    /// Print the preview transform for a view, buffer, and display rotation.
    Preview(PreviewArgs),
}

/// Cameras known to the capture backend.
#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Camera mapping, e.g. `back=/dev/video0`. Repeat for more cameras.
    #[arg(long = "device", value_name = "FACING=URI", value_parser = parse_device, default_value = "back=0")]
    pub devices: Vec<DeviceSpec>,
    /// Mounting rotation of every configured sensor, in degrees.
    #[arg(long = "sensor-orientation", value_name = "DEG", value_parser = parse_orientation, default_value = "0")]
    pub sensor_orientation: Orientation,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineCliArgs,
    #[command(flatten)]
    pub devices: DeviceArgs,
    /// TorchScript classifier.
    #[arg(long = "model", value_name = "PATH")]
    pub model: PathBuf,
    /// Newline-separated labels matching the model outputs.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: PathBuf,
    /// Square input size the model expects.
    #[arg(long = "input-size", value_name = "PX", default_value_t = 224)]
    pub input_size: u32,
    /// Current display rotation, in degrees.
    #[arg(long = "display-rotation", value_name = "DEG", value_parser = parse_orientation, default_value = "0")]
    pub display_rotation: Orientation,
    /// Preview surface size; publishes the matching transform once streaming.
    #[arg(long = "view", value_name = "WxH", value_parser = parse_resolution)]
    pub view: Option<Resolution>,
    /// Emit JSON lines instead of human-readable output.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    pub json: bool,
    /// Print Prometheus metrics on exit.
    #[arg(long = "metrics-dump", action = clap::ArgAction::SetTrue)]
    pub metrics_dump: bool,
    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long = "duration-secs", value_name = "SECS")]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct SensorsArgs {
    #[command(flatten)]
    pub devices: DeviceArgs,
    /// Requested stream size used to pick from each sensor's sizes.
    #[arg(long = "target", value_name = "WxH", value_parser = parse_resolution, default_value = "224x224")]
    pub target: Resolution,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    /// Preview surface size.
    #[arg(long = "view", value_name = "WxH", value_parser = parse_resolution)]
    pub view: Resolution,
    /// Sensor stream size.
    #[arg(long = "buffer", value_name = "WxH", value_parser = parse_resolution)]
    pub buffer: Resolution,
    /// Display rotation, in degrees.
    #[arg(long = "rotation", value_name = "DEG", value_parser = parse_orientation, default_value = "0")]
    pub rotation: Orientation,
}

/// One `--device` mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSpec {
    pub facing: Facing,
    pub uri: String,
}

fn parse_device(raw: &str) -> Result<DeviceSpec, String> {
    let (facing, uri) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FACING=URI, got `{raw}`"))?;
    let facing = match facing.trim().to_ascii_lowercase().as_str() {
        "back" => Facing::Back,
        "front" => Facing::Front,
        "external" => Facing::External,
        other => return Err(format!("unknown facing `{other}` (back, front, external)")),
    };
    let uri = uri.trim();
    if uri.is_empty() {
        return Err("device URI must not be empty".into());
    }
    Ok(DeviceSpec {
        facing,
        uri: uri.to_string(),
    })
}

fn parse_orientation(raw: &str) -> Result<Orientation, String> {
    let degrees = raw
        .trim()
        .trim_end_matches('°')
        .parse::<i32>()
        .map_err(|err| format!("`{raw}` is not a number of degrees: {err}"))?;
    Orientation::from_degrees(degrees)
        .ok_or_else(|| format!("{degrees} is not a multiple of 90 degrees"))
}

fn parse_resolution(raw: &str) -> Result<Resolution, String> {
    let (width, height) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got `{raw}`"))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("`{raw}`: {err}"))
    };
    Ok(Resolution::new(parse(width)?, parse(height)?))
}
