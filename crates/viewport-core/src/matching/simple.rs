//! Component C — Simple Matcher (spec.md §4.C).

use std::time::Instant;

use viewport_types::Viewport;

use crate::cv_backend;
use crate::error::Result;
use crate::pyramid::PyramidLevel;

#[derive(Debug, Clone, Copy)]
pub struct SimpleMatcherConfig {
    /// `N_query`: cap on query keypoints, spatially distributed over a
    /// `grid x grid` decomposition.
    pub max_query_features: usize,
    pub grid: u32,
    /// `τ_ratio`.
    pub ratio: f32,
    /// `τ_ransac`, in detection-space pixels.
    pub ransac_thresh_px: f64,
    /// `N_min`: minimum RANSAC inliers to accept.
    pub n_min: u32,
    /// `N_target`: inlier count considered a "full" confidence match.
    pub n_target: u32,
}

impl Default for SimpleMatcherConfig {
    fn default() -> Self {
        Self {
            max_query_features: 300,
            grid: 50,
            ratio: 0.75,
            ransac_thresh_px: 5.0,
            n_min: 8,
            n_target: 40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimpleMatchOutcome {
    pub viewport: Viewport,
    pub confidence: f64,
    pub inliers: u32,
    pub elapsed_ms: f64,
}

/// Extracts features from a query image, matches them against one pyramid
/// level, and estimates a similarity transform. Stateless beyond its
/// configured thresholds.
pub struct SimpleMatcher {
    config: SimpleMatcherConfig,
}

impl SimpleMatcher {
    pub fn new(config: SimpleMatcherConfig) -> Self {
        Self { config }
    }

    /// `query_det` is the preprocessed query frame, at whatever pixel size
    /// the frame processor handed it; it is resized down to `level.scale`
    /// internally so its feature appearance matches what the level was
    /// built from. The query's own extent in detection-space units is not
    /// its raw pixel size — it is recovered from the estimated RANSAC
    /// `scale` below, since a query crop does not necessarily cover
    /// exactly one detection-space pixel per query pixel.
    pub fn match_level(
        &self,
        query_det: &image::GrayImage,
        level: &PyramidLevel,
        roi: Option<Viewport>,
    ) -> Result<Option<SimpleMatchOutcome>> {
        let start = Instant::now();
        let (qw, qh) = query_det.dimensions();
        let (qw, qh) = (qw as f64, qh as f64);

        let resized = cv_backend::resize_area(query_det, level.scale)?;
        let (resized_kps, query_desc) =
            cv_backend::extract_akaze(&resized, self.config.max_query_features, self.config.grid)?;
        if resized_kps.is_empty() {
            return Ok(None);
        }
        let query_kps: Vec<cv_backend::Keypoint> = resized_kps
            .into_iter()
            .map(|kp| cv_backend::Keypoint {
                x: kp.x / level.scale,
                y: kp.y / level.scale,
                response: kp.response,
            })
            .collect();

        let (train_indices, train_desc_owned) = match roi {
            Some(r) => {
                let (idx, desc) = level.descriptors_in_roi(r)?;
                (idx, Some(desc))
            }
            None => ((0..level.keypoints.len()).collect(), None),
        };
        if train_indices.is_empty() {
            return Ok(None);
        }
        let train_desc = train_desc_owned.as_ref().unwrap_or(&level.descriptors);

        let matches = cv_backend::match_hamming_ratio_test(&query_desc, train_desc, self.config.ratio)?;
        if (matches.len() as u32) < self.config.n_min {
            return Ok(None);
        }

        let src_pts: Vec<(f64, f64)> = matches
            .iter()
            .map(|m| (query_kps[m.query_idx].x, query_kps[m.query_idx].y))
            .collect();
        let dst_pts: Vec<(f64, f64)> = matches
            .iter()
            .map(|m| {
                let orig = train_indices[m.train_idx];
                let kp = &level.keypoints[orig];
                (kp.x, kp.y)
            })
            .collect();

        let Some((similarity, inlier_mask)) =
            cv_backend::estimate_similarity_ransac(&src_pts, &dst_pts, self.config.ransac_thresh_px)?
        else {
            return Ok(None);
        };

        let inliers = inlier_mask.iter().filter(|&&b| b).count() as u32;
        if inliers < self.config.n_min {
            return Ok(None);
        }

        let (cx, cy) = similarity.apply(qw / 2.0, qh / 2.0);
        let viewport = viewport_in_detection_space(cx, cy, qw, qh, similarity.scale);

        let confidence = (inliers as f64 / self.config.n_target as f64).min(1.0)
            * (inliers as f64 / matches.len() as f64);

        Ok(Some(SimpleMatchOutcome {
            viewport,
            confidence,
            inliers,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        }))
    }
}

/// The query's pixel extent maps to detection-space units through the
/// fitted scale (spec.md §4.A: `w = W_src · DETECTION_SCALE / zoom`); a
/// naive `(qw, qh)` here would report the query's own crop size rather
/// than how large that crop is in detection space.
fn viewport_in_detection_space(cx: f64, cy: f64, qw: f64, qh: f64, scale: f64) -> Viewport {
    Viewport::from_center(cx, cy, qw * scale, qh * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_width_height_scale_with_ransac_scale() {
        let unit = viewport_in_detection_space(960.0, 540.0, 1920.0, 1080.0, 1.0);
        assert_eq!(unit.w, 1920.0);
        assert_eq!(unit.h, 1080.0);

        // A zoomed-out query (similarity.scale < 1) covers more detection-
        // space ground than its raw pixel crop size would suggest.
        let zoomed_out = viewport_in_detection_space(960.0, 540.0, 1920.0, 1080.0, 0.5);
        assert_eq!(zoomed_out.w, 960.0);
        assert_eq!(zoomed_out.h, 540.0);

        // A zoomed-in query (similarity.scale > 1) covers less.
        let zoomed_in = viewport_in_detection_space(960.0, 540.0, 1920.0, 1080.0, 2.0);
        assert_eq!(zoomed_in.w, 3840.0);
        assert_eq!(zoomed_in.h, 2160.0);
    }

    #[test]
    fn viewport_is_centered_on_the_mapped_query_center() {
        let v = viewport_in_detection_space(500.0, 300.0, 200.0, 100.0, 1.0);
        let (cx, cy) = v.center();
        assert!((cx - 500.0).abs() < 1e-9);
        assert!((cy - 300.0).abs() < 1e-9);
    }
}
