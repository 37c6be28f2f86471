//! Subcommand handlers.

use std::{fmt::Write as _, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result, bail};
use capture::{CaptureBackend, Resolution, SensorInfo, select_optimal};
use crossbeam_channel::bounded;
use ml_core::Classifier;
use tracing::{info, warn};
use vision::{
    DisplaySink, PackedConverter, Pipeline, PipelineConfig, TelemetryOptions, compute_transform,
    fit_to_aspect, preview_aspect, telemetry,
};

use crate::{
    cli::{DeviceArgs, PreviewArgs, RunArgs, SensorsArgs},
    display::{ConsoleSink, JsonSink},
};

/// Attempts at configuring the stream before giving up.
const CONFIGURE_ATTEMPTS: u32 = 3;

pub fn run(args: RunArgs) -> Result<()> {
    let config = PipelineConfig::try_from(args.pipeline)?;
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if args.metrics_dump {
        telemetry::init_metrics_recorder();
    }

    let classifier = load_classifier(&args.model, &args.labels, args.input_size)?;
    let backend = open_backend(&args.devices)?;
    let sink: Arc<dyn DisplaySink> = if args.json {
        Arc::new(JsonSink::stdout())
    } else {
        Arc::new(ConsoleSink::stdout())
    };

    let mut pipeline = Pipeline::open(backend, classifier, Box::new(PackedConverter), sink, config)
        .context("failed to open camera")?;
    pipeline.set_display_rotation(args.display_rotation);
    if let Some(view) = args.view {
        pipeline.on_view_resized(view, args.display_rotation);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        match pipeline.configure() {
            Ok(()) => break,
            Err(err) if !err.is_fatal() && attempt < CONFIGURE_ATTEMPTS => {
                warn!("stream configuration failed (attempt #{attempt}): {err}");
                thread::sleep(Duration::from_millis(200));
            }
            Err(err) => return Err(err).context("failed to start streaming"),
        }
    }
    info!(
        sensor = %pipeline.sensor().id,
        resolution = %pipeline.resolution(),
        "streaming; press Ctrl+C to stop"
    );

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    let handler_tx = shutdown_tx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = handler_tx.try_send(());
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }
    let outcome = pipeline.supervise(&shutdown_rx, args.duration_secs.map(Duration::from_secs));
    drop(shutdown_tx);

    pipeline.stop();
    if args.metrics_dump {
        if let Some(text) = telemetry::render_metrics() {
            print!("{text}");
        }
    }
    outcome.context("camera stream ended unexpectedly")
}

pub fn sensors(args: SensorsArgs) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let backend = open_backend(&args.devices)?;
    let sensors = backend
        .enumerate_sensors()
        .context("failed to enumerate cameras")?;
    if sensors.is_empty() {
        bail!("no camera could be opened");
    }
    for sensor in &sensors {
        print!("{}", describe_sensor(sensor, args.target));
    }
    Ok(())
}

pub fn preview(args: PreviewArgs) -> Result<()> {
    print!("{}", describe_preview(&args));
    Ok(())
}

fn describe_sensor(sensor: &SensorInfo, target: Resolution) -> String {
    let mut out = String::new();
    let sizes: Vec<String> = sensor.supported.iter().map(ToString::to_string).collect();
    let _ = writeln!(
        out,
        "{} ({}, mounted {})",
        sensor.id, sensor.facing, sensor.orientation
    );
    let _ = writeln!(out, "  sizes: {}", sizes.join(", "));
    let _ = match select_optimal(&sensor.supported, target.width, target.height) {
        Ok(size) => writeln!(out, "  stream for {target}: {size}"),
        Err(err) => writeln!(out, "  stream for {target}: {err}"),
    };
    out
}

fn describe_preview(args: &PreviewArgs) -> String {
    let m = compute_transform(args.view, args.buffer, args.rotation);
    let landscape = args.view.width >= args.view.height;
    let fitted = fit_to_aspect(args.view, preview_aspect(args.buffer, landscape));
    format!(
        "| {:>10.4} {:>10.4} {:>10.4} |\n| {:>10.4} {:>10.4} {:>10.4} |\nsurface: {fitted}\n",
        m.sx, m.kx, m.tx, m.ky, m.sy, m.ty
    )
}

#[cfg(feature = "with-tch")]
fn load_classifier(
    model: &std::path::Path,
    labels: &std::path::Path,
    input_size: u32,
) -> Result<Classifier> {
    use ml_core::{TorchEngine, tch::Device};

    let engine = TorchEngine::new(
        Device::cuda_if_available(),
        labels,
        Resolution::new(input_size, input_size),
    )
    .with_context(|| format!("failed to read labels from {}", labels.display()))?;
    Classifier::load(Box::new(engine), model)
        .with_context(|| format!("failed to load model {}", model.display()))
}

#[cfg(not(feature = "with-tch"))]
fn load_classifier(
    _model: &std::path::Path,
    _labels: &std::path::Path,
    _input_size: u32,
) -> Result<Classifier> {
    bail!("built without TorchScript support; rebuild with `--features with-tch`")
}

#[cfg(feature = "with-opencv")]
fn open_backend(args: &DeviceArgs) -> Result<Arc<dyn CaptureBackend>> {
    Ok(Arc::new(crate::opencv_backend::OpenCvBackend::new(
        args.devices.clone(),
        args.sensor_orientation,
    )))
}

#[cfg(not(feature = "with-opencv"))]
fn open_backend(_args: &DeviceArgs) -> Result<Arc<dyn CaptureBackend>> {
    bail!("built without camera support; rebuild with `--features with-opencv`")
}
