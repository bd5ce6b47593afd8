//! Error taxonomy (spec.md §7).
//!
//! `Error` covers startup/fatal conditions only: the core refuses to start
//! on these. Per-tick recoverable outcomes are `Skip`, never an `Error` —
//! they are reduced to a specific `Published` state or a skipped
//! publication and never unwind out of the producer loop.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load reference map from {path}: {source}")]
    ReferenceMapLoad {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("calibration control points invalid or missing: {0}")]
    InvalidCalibration(String),
    #[error("feature pyramid build failed: {0}")]
    PyramidBuild(String),
    #[error("feature pyramid cache I/O error: {source}")]
    PyramidCacheIo {
        #[from]
        source: std::io::Error,
    },
    #[error("feature pyramid cache deserialization error: {source}")]
    PyramidCacheDecode {
        #[from]
        source: bincode::Error,
    },
    #[error("opencv error: {source}")]
    OpenCv {
        #[from]
        source: opencv::Error,
    },
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A recoverable, per-tick outcome. None of these are exceptions; the
/// producer loop matches on this and continues (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Capture function reported the window/frame was not ready.
    TransientCapture,
    /// Content digest matched the prior frame's; no downstream work done.
    Duplicate,
    /// Map-visibility detector returned false; matching was not attempted.
    MapHidden,
    /// Frame's capture time was not strictly after the previously processed
    /// frame's; dropped per the monotonic-timestamp invariant (spec.md §3).
    OutOfOrder,
    /// Every matching method failed this tick.
    Lost,
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Skip::TransientCapture => "transient capture error",
            Skip::Duplicate => "duplicate frame",
            Skip::MapHidden => "map hidden",
            Skip::OutOfOrder => "out-of-order frame",
            Skip::Lost => "tracking lost",
        };
        f.write_str(s)
    }
}
