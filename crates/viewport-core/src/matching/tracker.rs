//! Component E — Translation Tracker (spec.md §4.E).

use image::GrayImage;

use crate::cv_backend;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct TrackerOutcome {
    /// Detection-space shift to apply to the last viewport; already sign-
    /// inverted from the raw phase-correlation shift (image content moving
    /// right means the viewport moved left).
    pub dx: f64,
    pub dy: f64,
    /// Normalized phase-correlation peak height, `response` in spec.md §4.E.
    pub confidence: f64,
}

/// COLD (no previous frame) / WARM (phase-correlates against the previous
/// frame) state machine. Owned exclusively by the Matching Coordinator.
pub struct TranslationTracker {
    scale: f64,
    prev: Option<GrayImage>,
}

impl TranslationTracker {
    /// `scale` is the tracker's working resolution, recommended `0.25`
    /// (spec.md §4.E); the coordinator may widen it to `0.5` when predicted
    /// movement is small.
    pub fn new(scale: f64) -> Self {
        Self { scale, prev: None }
    }

    pub fn set_scale(&mut self, scale: f64) {
        if (scale - self.scale).abs() > f64::EPSILON {
            self.scale = scale;
            // A scale change invalidates the pooled previous frame: its size
            // no longer matches what a fresh resize would produce.
            self.prev = None;
        }
    }

    /// Feed the current preprocessed query frame (at native detection-space
    /// size). Returns `None` while COLD or after a size-mismatch reset;
    /// otherwise the WARM shift estimate.
    pub fn update(&mut self, query_det: &GrayImage) -> Result<Option<TrackerOutcome>> {
        let resized = cv_backend::resize_area(query_det, self.scale)?;

        let prev = match self.prev.take() {
            None => {
                self.prev = Some(resized);
                return Ok(None);
            }
            Some(prev) => prev,
        };

        if prev.dimensions() != resized.dimensions() {
            self.prev = Some(resized);
            return Ok(None);
        }

        let (raw_dx, raw_dy, response) = cv_backend::phase_correlate(&prev, &resized)?;
        self.prev = Some(resized);

        Ok(Some(TrackerOutcome {
            dx: -raw_dx / self.scale,
            dy: -raw_dy / self.scale,
            confidence: response.clamp(0.0, 1.0),
        }))
    }

    /// Drop back to COLD. Triggered by the coordinator on loss of tracking.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn checker(w: u32, h: u32, offset_x: i64, offset_y: i64) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let xi = x as i64 + offset_x;
            let yi = y as i64 + offset_y;
            let v = if ((xi / 8) + (yi / 8)) % 2 == 0 { 230u8 } else { 20u8 };
            Luma([v])
        })
    }

    #[test]
    fn cold_then_warm_transitions() {
        let mut tracker = TranslationTracker::new(1.0);
        let frame_a = checker(256, 256, 0, 0);
        assert!(tracker.update(&frame_a).unwrap().is_none());

        let frame_b = checker(256, 256, 5, 0);
        let outcome = tracker.update(&frame_b).unwrap();
        assert!(outcome.is_some());
    }

    #[test]
    fn size_change_resets_to_cold() {
        let mut tracker = TranslationTracker::new(1.0);
        let frame_a = checker(256, 256, 0, 0);
        tracker.update(&frame_a).unwrap();

        let frame_b = checker(300, 256, 0, 0);
        assert!(tracker.update(&frame_b).unwrap().is_none());
    }
}
