//! Terminal display sinks.

use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError},
};

use ml_core::ClassificationResult;
use serde::Serialize;
use tracing::{debug, warn};
use vision::{AffineMatrix, DisplaySink};

type Output = Mutex<Box<dyn Write + Send>>;

fn write_line(out: &Output, line: std::fmt::Arguments<'_>) {
    let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = writeln!(out, "{line}").and_then(|_| out.flush()) {
        warn!("failed to write display output: {err}");
    }
}

/// Human-readable output, one line per result.
pub struct ConsoleSink {
    out: Output,
}

impl ConsoleSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl DisplaySink for ConsoleSink {
    fn publish_result(&self, result: &ClassificationResult) {
        write_line(&self.out, format_args!("{result}"));
    }

    fn publish_transform(&self, transform: &AffineMatrix) {
        debug!(?transform, "preview transform updated");
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event<'a> {
    Result {
        #[serde(flatten)]
        result: &'a ClassificationResult,
    },
    Transform {
        matrix: [f32; 6],
    },
}

/// JSON-lines output for piping into other tools.
pub struct JsonSink {
    out: Output,
}

impl JsonSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    fn emit(&self, event: &Event<'_>) {
        match serde_json::to_string(event) {
            Ok(line) => write_line(&self.out, format_args!("{line}")),
            Err(err) => warn!("failed to serialise display event: {err}"),
        }
    }
}

impl DisplaySink for JsonSink {
    fn publish_result(&self, result: &ClassificationResult) {
        self.emit(&Event::Result { result });
    }

    fn publish_transform(&self, transform: &AffineMatrix) {
        let AffineMatrix {
            sx,
            kx,
            tx,
            ky,
            sy,
            ty,
        } = *transform;
        self.emit(&Event::Transform {
            matrix: [sx, kx, tx, ky, sy, ty],
        });
    }
}
