//! The one capture dependency the core consumes (spec.md §6). Platform-
//! specific window capture is an out-of-scope external collaborator
//! (spec.md §1); this module only provides the glue a host backend plugs
//! into, plus a file-backed capture source for `--once` and local testing.

use std::path::PathBuf;

use viewport_core::error::{Error, Result};
use viewport_core::frame::{CaptureSource, CapturedFrame};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reads a single fixed image file every call, stamping it with the
/// current wall-clock time. Used for `--once` and for exercising the
/// server without a real window-capture backend wired in.
pub struct FileCaptureSource {
    path: PathBuf,
}

impl FileCaptureSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CaptureSource for FileCaptureSource {
    fn capture(&mut self) -> Result<CapturedFrame> {
        let image = image::open(&self.path)
            .map_err(|source| Error::ReferenceMapLoad {
                path: self.path.display().to_string(),
                source,
            })?
            .to_rgb8();
        Ok(CapturedFrame { image, captured_at_ms: now_ms() })
    }
}

/// No real window-capture backend is wired in; every call reports a
/// capture error, which the frame processor surfaces as a transient skip
/// rather than a fatal error (spec.md §7: "window not ready"). A real
/// deployment replaces this with an OS-specific backend implementing
/// `CaptureSource`.
pub struct UnconfiguredCaptureSource;

impl CaptureSource for UnconfiguredCaptureSource {
    fn capture(&mut self) -> Result<CapturedFrame> {
        Err(Error::Config("no capture backend configured".to_string()))
    }
}
