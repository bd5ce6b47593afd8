//! Wire types shared between the matching core and any transport that
//! exposes it (HTTP/WebSocket, tests). Kept dependency-light on purpose:
//! no OpenCV, no FFT, nothing that would force a transport-only consumer
//! to pull in the matching engine.

use serde::{Deserialize, Serialize};

/// A rectangle in detection-space pixels (half-scale of the reference map).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Viewport {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn from_center(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    /// Translate by a detection-space shift, keeping size fixed.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    /// Clip so the rectangle lies entirely within `[0, w_max] x [0, h_max]`.
    /// Invariant I-1 (spec.md §3): every emitted viewport satisfies this.
    pub fn clipped(&self, w_max: f64, h_max: f64) -> Self {
        let w = self.w.min(w_max);
        let h = self.h.min(h_max);
        let x = self.x.max(0.0).min(w_max - w);
        let y = self.y.max(0.0).min(h_max - h);
        Self { x, y, w, h }
    }

    /// Expand around the center by `factor` (used to build an ROI margin).
    pub fn expanded(&self, factor: f64) -> Self {
        let (cx, cy) = self.center();
        Self::from_center(cx, cy, self.w * factor, self.h * factor)
    }
}

/// How a `MatchResult`/`Published` record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// First successful full-map cascade match, or a periodic revalidation.
    Full,
    /// Cascade restricted to a region of interest around the predicted position.
    Roi,
    /// Derived purely from the translation tracker, cascade not run.
    MotionOnly,
    /// Every method failed; tracking considered lost.
    Lost,
}

/// The outcome of a single matching attempt, returned by `match_once` and
/// fed into the bus on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub viewport: Viewport,
    pub confidence: f64,
    pub inliers: u32,
    pub level_used: Option<String>,
    pub elapsed_ms: f64,
    pub method: MatchMethod,
}

/// A collectible already transformed into source-image (screen) pixel
/// space, with the HUD crop undone, ready for overlay rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectibleInView {
    pub screen_x: f32,
    pub screen_y: f32,
    pub category: String,
    pub payload_ref: String,
}

/// The single record the Viewport Bus publishes. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Published {
    pub viewport: Viewport,
    pub confidence: f64,
    pub method: MatchMethod,
    /// Capture instant, in milliseconds since the Unix epoch. This is the
    /// frame's capture timestamp, never the publication timestamp
    /// (spec.md §3 invariant I-4).
    pub timestamp_ms: i64,
    pub collectibles_in_view: Vec<CollectibleInView>,
}

/// Per-method frame counters for the metrics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodCounts {
    pub full: u64,
    pub roi: u64,
    pub motion_only: u64,
    pub lost: u64,
}

/// P50/P90/P95 latency percentiles, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
}

/// A read-only, consistent snapshot of the metrics aggregator (spec.md §4.I).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_attempted: u64,
    pub frames_published: u64,
    pub duplicates_skipped: u64,
    pub map_hidden: u64,
    pub method_counts: MethodCounts,
    pub capture_latency: LatencyPercentiles,
    pub match_latency: LatencyPercentiles,
    pub total_latency: LatencyPercentiles,
    pub target_fps: f64,
    pub utilization: f64,
    /// Fraction of published frames served by the translation tracker alone.
    pub tracker_prediction_rate: f64,
    /// Histogram of which cascade level (by name) accepted a match.
    pub cascade_level_histogram: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_viewport_in_bounds() {
        let v = Viewport::new(-5.0, -5.0, 100.0, 80.0).clipped(90.0, 70.0);
        assert!(v.x >= 0.0 && v.y >= 0.0);
        assert!(v.x + v.w <= 90.0 + 1e-9);
        assert!(v.y + v.h <= 70.0 + 1e-9);
    }

    #[test]
    fn clip_oversized_viewport_anchors_at_origin() {
        let v = Viewport::new(10.0, 10.0, 500.0, 500.0).clipped(200.0, 150.0);
        assert_eq!(v.w, 200.0);
        assert_eq!(v.h, 150.0);
        assert_eq!(v.x, 0.0);
        assert_eq!(v.y, 0.0);
    }

    #[test]
    fn center_round_trip() {
        let v = Viewport::from_center(500.0, 300.0, 40.0, 30.0);
        let (cx, cy) = v.center();
        assert!((cx - 500.0).abs() < 1e-9);
        assert!((cy - 300.0).abs() < 1e-9);
    }
}
