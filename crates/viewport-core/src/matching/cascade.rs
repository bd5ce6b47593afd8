//! Component D — Cascade Matcher (spec.md §4.D).

use viewport_types::Viewport;

use crate::error::Result;
use crate::pyramid::FeaturePyramid;

use super::simple::{SimpleMatchOutcome, SimpleMatcher};

/// One rung of the cascade: which pyramid level to try, the matcher tuned
/// for it (its `N_min_s` lives inside `matcher`'s config), and the
/// confidence floor required to accept without trying the next rung.
pub struct CascadeLevel {
    pub level_name: &'static str,
    pub tau_conf: f64,
    pub matcher: SimpleMatcher,
}

/// Per-level timing, reported regardless of acceptance, for diagnostics.
#[derive(Debug, Clone)]
pub struct CascadeAttempt {
    pub level_name: &'static str,
    pub elapsed_ms: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub result: SimpleMatchOutcome,
    pub level_used: &'static str,
    pub attempts: Vec<CascadeAttempt>,
}

/// Tries an ordered list of levels, accepting the first whose result meets
/// its own confidence floor. The last level is conventionally configured
/// with `tau_conf = 0.0`, making it an unconditional fallback.
pub struct CascadeMatcher {
    levels: Vec<CascadeLevel>,
}

impl CascadeMatcher {
    pub fn new(levels: Vec<CascadeLevel>) -> Self {
        Self { levels }
    }

    pub fn match_pyramid(
        &self,
        query_det: &image::GrayImage,
        pyramid: &FeaturePyramid,
        roi: Option<Viewport>,
    ) -> Result<Option<CascadeOutcome>> {
        let mut attempts = Vec::with_capacity(self.levels.len());

        for plan in &self.levels {
            let Some(level) = pyramid.levels.iter().find(|l| l.name == plan.level_name) else {
                tracing::warn!(level = plan.level_name, "cascade level has no matching pyramid level, skipping");
                continue;
            };

            let outcome = plan.matcher.match_level(query_det, level, roi)?;
            let elapsed_ms = outcome.as_ref().map(|o| o.elapsed_ms).unwrap_or(0.0);

            match outcome {
                Some(result) if result.confidence >= plan.tau_conf => {
                    attempts.push(CascadeAttempt {
                        level_name: plan.level_name,
                        elapsed_ms,
                        accepted: true,
                    });
                    return Ok(Some(CascadeOutcome {
                        result,
                        level_used: plan.level_name,
                        attempts,
                    }));
                }
                _ => {
                    attempts.push(CascadeAttempt {
                        level_name: plan.level_name,
                        elapsed_ms,
                        accepted: false,
                    });
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::simple::SimpleMatcherConfig;
    use crate::pyramid::FeaturePyramid;

    #[test]
    fn empty_pyramid_yields_no_match() {
        let cascade = CascadeMatcher::new(vec![CascadeLevel {
            level_name: "fine",
            tau_conf: 0.5,
            matcher: SimpleMatcher::new(SimpleMatcherConfig::default()),
        }]);
        let pyramid = FeaturePyramid { levels: vec![] };
        let query = image::GrayImage::new(64, 64);

        let outcome = cascade.match_pyramid(&query, &pyramid, None).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn level_with_no_matching_pyramid_level_is_skipped_not_fatal() {
        // A cascade plan naming a level absent from the built pyramid (e.g.
        // a stale config referencing a level that was renamed) is skipped
        // rather than failing the whole match.
        let cascade = CascadeMatcher::new(vec![
            CascadeLevel {
                level_name: "nonexistent",
                tau_conf: 0.0,
                matcher: SimpleMatcher::new(SimpleMatcherConfig::default()),
            },
        ]);
        let pyramid = FeaturePyramid { levels: vec![] };
        let query = image::GrayImage::new(64, 64);

        let outcome = cascade.match_pyramid(&query, &pyramid, None).unwrap();
        assert!(outcome.is_none());
    }
}
