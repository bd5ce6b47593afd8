//! Component F — Matching Coordinator (spec.md §4.F).
//!
//! Sole owner of the mutable tracker/viewport state; everything else in
//! the matching stack is a pure function of its inputs.

use std::time::Instant;

use viewport_types::{MatchMethod, MatchResult, Viewport};

use crate::error::Result;
use crate::pyramid::FeaturePyramid;

use super::cascade::CascadeMatcher;
use super::tracker::TranslationTracker;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// `τ_last`: minimum last confidence to attempt the motion-only path.
    pub tau_last: f64,
    /// `τ_phase`: minimum phase-correlation response to trust a motion-only shift.
    pub tau_phase: f64,
    /// `τ_roi`: minimum last confidence to attempt an ROI-restricted cascade.
    pub tau_roi: f64,
    /// ROI margin, expressed as a multiple of the last viewport's size.
    pub roi_margin_factor: f64,
    /// `K_revalidate`: force a full cascade run this often even while
    /// motion-only tracking stays confident, to bound cumulative drift.
    pub k_revalidate: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tau_last: 0.8,
            tau_phase: 0.9,
            tau_roi: 0.5,
            roi_margin_factor: 1.5,
            k_revalidate: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorOutcome {
    Matched(MatchResult),
    Lost,
}

pub struct MatchingCoordinator {
    config: CoordinatorConfig,
    cascade: CascadeMatcher,
    tracker: TranslationTracker,
    det_w: f64,
    det_h: f64,
    v_last: Option<Viewport>,
    c_last: f64,
    frames_since_revalidate: u64,
}

impl MatchingCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        cascade: CascadeMatcher,
        tracker: TranslationTracker,
        det_w: f64,
        det_h: f64,
    ) -> Self {
        Self {
            config,
            cascade,
            tracker,
            det_w,
            det_h,
            v_last: None,
            c_last: 0.0,
            frames_since_revalidate: 0,
        }
    }

    pub fn last_viewport(&self) -> Option<Viewport> {
        self.v_last
    }

    pub fn last_confidence(&self) -> f64 {
        self.c_last
    }

    /// Forces lost state: clears the last viewport, resets the tracker to
    /// COLD, and zeroes the revalidation counter so the very next match is
    /// a full cascade (spec.md §8 idempotence law).
    pub fn reset_tracking(&mut self) {
        self.v_last = None;
        self.c_last = 0.0;
        self.tracker.reset();
        self.frames_since_revalidate = 0;
    }

    /// Runs the §4.F decision tree for one frame and returns either a
    /// matched result or `Lost`. Never panics or propagates a matching
    /// failure as an error — all matcher failure modes collapse to `Lost`.
    pub fn process(
        &mut self,
        query_det: &image::GrayImage,
        pyramid: &FeaturePyramid,
    ) -> Result<CoordinatorOutcome> {
        let start = Instant::now();
        let tracker_outcome = self.tracker.update(query_det)?;
        let force_revalidate =
            self.v_last.is_some() && self.frames_since_revalidate >= self.config.k_revalidate;

        // Step 1: motion-only fast path.
        if !force_revalidate {
            if let (Some(v_last), Some(tracker)) = (self.v_last, tracker_outcome) {
                if self.c_last >= self.config.tau_last && tracker.confidence >= self.config.tau_phase {
                    let v_new = v_last.translated(tracker.dx, tracker.dy).clipped(self.det_w, self.det_h);
                    let confidence = self.c_last.min(tracker.confidence);
                    self.v_last = Some(v_new);
                    self.c_last = confidence;
                    self.frames_since_revalidate += 1;
                    return Ok(CoordinatorOutcome::Matched(MatchResult {
                        viewport: v_new,
                        confidence,
                        inliers: 0,
                        level_used: None,
                        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                        method: MatchMethod::MotionOnly,
                    }));
                }
            }
        }

        // Step 2: ROI-restricted cascade, unless we're forcing a full
        // revalidation this frame.
        if !force_revalidate {
            if let Some(v_last) = self.v_last {
                if self.c_last >= self.config.tau_roi {
                    let predicted = match tracker_outcome {
                        Some(t) => v_last.translated(t.dx, t.dy),
                        None => v_last,
                    };
                    let roi = predicted.expanded(self.config.roi_margin_factor);
                    if let Some(outcome) = self.cascade.match_pyramid(query_det, pyramid, Some(roi))? {
                        return Ok(self.accept(outcome, MatchMethod::Roi, start));
                    }
                }
            }
        }

        // Step 3: full cascade over the whole detection map.
        if let Some(outcome) = self.cascade.match_pyramid(query_det, pyramid, None)? {
            return Ok(self.accept(outcome, MatchMethod::Full, start));
        }

        // Step 4: lost.
        Ok(self.give_up(start))
    }

    fn accept(
        &mut self,
        outcome: super::cascade::CascadeOutcome,
        method: MatchMethod,
        start: Instant,
    ) -> CoordinatorOutcome {
        let viewport = outcome.result.viewport.clipped(self.det_w, self.det_h);
        self.v_last = Some(viewport);
        self.c_last = outcome.result.confidence;
        self.frames_since_revalidate = 0;
        CoordinatorOutcome::Matched(MatchResult {
            viewport,
            confidence: outcome.result.confidence,
            inliers: outcome.result.inliers,
            level_used: Some(outcome.level_used.to_string()),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            method,
        })
    }

    /// Runs a full-map cascade match without touching tracked state, for
    /// `match_once` (spec.md §6): manual alignment requests must not
    /// perturb the running producer's own tracking.
    pub fn match_full_stateless(
        &self,
        query_det: &image::GrayImage,
        pyramid: &FeaturePyramid,
    ) -> Result<Option<MatchResult>> {
        let start = Instant::now();
        Ok(self.cascade.match_pyramid(query_det, pyramid, None)?.map(|outcome| MatchResult {
            viewport: outcome.result.viewport.clipped(self.det_w, self.det_h),
            confidence: outcome.result.confidence,
            inliers: outcome.result.inliers,
            level_used: Some(outcome.level_used.to_string()),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            method: MatchMethod::Full,
        }))
    }

    fn give_up(&mut self, _start: Instant) -> CoordinatorOutcome {
        self.v_last = None;
        self.c_last = 0.0;
        self.tracker.reset();
        self.frames_since_revalidate = 0;
        CoordinatorOutcome::Lost
    }
}
