//! Telemetry helpers: tracing subscribers, Prometheus metrics, and named threads.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, warn};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the runtime subscriber installed for the current thread and flushes
/// any chrome trace when dropped.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
            drop(guard);
            if let Some(path) = self.chrome_trace_path.as_ref() {
                debug!("chrome trace written to {}", path.display());
            }
        }
    }
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            warn!("metrics recorder already installed, exposition will be empty: {err}");
        }

        let upkeep_handle = handle.clone();
        let upkeep = spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            }
        });
        if let Err(err) = upkeep {
            warn!("failed to spawn prometheus upkeep thread: {err}");
        }

        handle
    })
}

/// Rendered Prometheus exposition text, when the recorder is installed.
pub fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

/// Install the tracing subscriber for the current thread.
///
/// `RUST_LOG` overrides the default `info` filter. Threads started through
/// [`spawn_thread`] inherit the same subscriber.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_guard,
        chrome_trace_path: opts.chrome_trace_path.clone(),
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(tracing_chrome::ChromeLayer<Registry>, tracing_chrome::FlushGuard)> {
    let file = File::create(path)?;
    Ok(tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn spawned_threads_inherit_the_dispatcher() {
        let _guard = enter_runtime(&TelemetryOptions::default());
        let saw_subscriber = Arc::new(AtomicBool::new(false));
        let flag = saw_subscriber.clone();
        spawn_thread("telemetry-test", move || {
            let has = tracing::dispatcher::get_default(|current| {
                !current.is::<tracing::subscriber::NoSubscriber>()
            });
            flag.store(has, Ordering::SeqCst);
        })
        .unwrap()
        .join()
        .unwrap();
        assert!(saw_subscriber.load(Ordering::SeqCst));
    }

    #[test]
    fn metrics_recorder_renders_counters() {
        let handle = init_metrics_recorder();
        metrics::counter!("pipeline_telemetry_selftest_total").increment(3);
        assert!(std::ptr::eq(handle, init_metrics_recorder()));
        let text = render_metrics().unwrap();
        assert!(text.contains("pipeline_telemetry_selftest_total 3"));
    }
}
