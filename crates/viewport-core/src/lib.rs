//! `viewport-core`: the real-time viewport localization and tracking
//! pipeline (spec.md §1-§6).
//!
//! This crate is transport-agnostic. It exposes the typed interface
//! `viewport-server` wraps for HTTP/WebSocket: [`ApplicationState::start`],
//! [`ApplicationState::match_once`], [`ApplicationState::subscribe`]/
//! [`ApplicationState::get_latest`], [`ApplicationState::get_stats`],
//! [`ApplicationState::reset_tracking`], [`ApplicationState::reload_collectibles`].

pub mod bus;
pub mod collectibles;
pub mod cv_backend;
pub mod error;
pub mod frame;
pub mod matching;
pub mod pyramid;
pub mod scheduler;
pub mod transform;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use viewport_types::{MatchMethod, MatchResult, MetricsSnapshot, Published};

use bus::{Metrics, TickTiming, ViewportBus};
use collectibles::{Collectible, CollectibleStore};
use error::{Error, Result, Skip};
use frame::{CaptureSource, FrameProcessor, CROP};
use matching::{CascadeLevel, CascadeMatcher, CoordinatorConfig, MatchingCoordinator, SimpleMatcher};
use pyramid::{FeaturePyramid, LevelSpec};
use scheduler::AdaptiveScheduler;
use transform::{ControlPoint, CoordinateTransform, DETECTION_SCALE};

/// Source capture dimensions this core supports (spec.md §1 Non-goals:
/// "multi-monitor or resolutions other than a single 1920x1080 source").
pub const SOURCE_W: f64 = 1920.0;
pub const SOURCE_H: f64 = 1080.0;

/// Everything the matching stack needs to run, built once at startup and
/// shared by reference count across the producer thread and any number of
/// read-only consumer threads (spec.md §9).
pub struct ApplicationState {
    detection_map: Arc<image::GrayImage>,
    pyramid: Arc<FeaturePyramid>,
    transform: Arc<CoordinateTransform>,
    collectibles: Arc<CollectibleStore>,
    bus: Arc<ViewportBus>,
    metrics: Arc<Metrics>,
    cancel: Arc<AtomicBool>,
    coordinator: Arc<Mutex<MatchingCoordinator>>,
    frame_processor: Arc<Mutex<FrameProcessor>>,
    scheduler_stats: Arc<Mutex<scheduler::SchedulerStats>>,
    initial_target_fps: f64,
    min_fps: f64,
    max_fps: Option<f64>,
    capture: Arc<Mutex<Box<dyn CaptureSource>>>,
    det_w: f64,
    det_h: f64,
}

/// How the matching stack is wired at startup: where the reference map
/// and calibration live, and the policy knobs §4.D/§4.F expose.
pub struct StartupConfig {
    pub reference_map_path: std::path::PathBuf,
    pub pyramid_cache_path: std::path::PathBuf,
    pub control_points: Vec<ControlPoint>,
    pub level_specs: Vec<LevelSpec>,
    pub coordinator: CoordinatorConfig,
    pub initial_target_fps: f64,
    /// Scheduler floor (spec.md §4.H step 5 clamp).
    pub min_fps: f64,
    /// Optional scheduler ceiling; uncapped by default.
    pub max_fps: Option<f64>,
    pub collectibles: Vec<Collectible>,
    /// Per-level `(tau_conf, n_min)` overrides, keyed by level name,
    /// layered over the cascade's computed defaults (spec.md §4.D).
    pub cascade_overrides: std::collections::HashMap<String, CascadeLevelOverride>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            reference_map_path: std::path::PathBuf::from("reference_map.png"),
            pyramid_cache_path: std::path::PathBuf::from("pyramid_cache.bin"),
            control_points: Vec::new(),
            level_specs: pyramid::default_level_specs(),
            coordinator: CoordinatorConfig::default(),
            initial_target_fps: 15.0,
            min_fps: 5.0,
            max_fps: None,
            collectibles: Vec::new(),
            cascade_overrides: std::collections::HashMap::new(),
        }
    }
}

/// A host-supplied override for one cascade level's acceptance threshold
/// and/or minimum inlier count (spec.md §4.D); either field left `None`
/// keeps the computed default for that level.
#[derive(Debug, Clone, Copy, Default)]
pub struct CascadeLevelOverride {
    pub tau_conf: Option<f64>,
    pub n_min: Option<u32>,
}

/// Acceptance thresholds per cascade level, layered over `SimpleMatcherConfig`
/// defaults; the last level is conventionally `tau_conf = 0.0`
/// (unconditional fallback) per spec.md §4.D.
fn build_cascade(
    level_specs: &[LevelSpec],
    overrides: &std::collections::HashMap<String, CascadeLevelOverride>,
) -> CascadeMatcher {
    let n = level_specs.len();
    let levels = level_specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let mut cfg = matching::SimpleMatcherConfig::default();
            // Coarser levels need fewer inliers to accept; scale n_min
            // down with the level's own feature budget so the floor isn't
            // unreachable at low resolution.
            cfg.n_min = (8 + i as u32 * 4).min(spec.feature_budget as u32 / 20 + 8);
            let is_last = i + 1 == n;
            let mut tau_conf = if is_last { 0.0 } else { 0.55 + 0.1 * i as f64 };

            if let Some(o) = overrides.get(spec.name) {
                if let Some(tau) = o.tau_conf {
                    tau_conf = tau;
                }
                if let Some(n_min) = o.n_min {
                    cfg.n_min = n_min;
                }
            }

            CascadeLevel {
                level_name: spec.name,
                tau_conf,
                matcher: SimpleMatcher::new(cfg),
            }
        })
        .collect();
    CascadeMatcher::new(levels)
}

impl ApplicationState {
    /// Loads the reference map, builds/loads the feature pyramid, fits the
    /// coordinate transform, and constructs the matching coordinator. A
    /// failure here is fatal to startup (spec.md §4.B Failures, §7
    /// "Initialization failure... fatal; the core refuses to start").
    pub fn init(config: StartupConfig, capture: Box<dyn CaptureSource>) -> Result<Self> {
        let reference_map = image::open(&config.reference_map_path)
            .map_err(|source| Error::ReferenceMapLoad {
                path: config.reference_map_path.display().to_string(),
                source,
            })?
            .to_luma8();

        let detection_map = cv_backend::resize_area(&reference_map, DETECTION_SCALE)?;
        let (det_w, det_h) = detection_map.dimensions();
        let (det_w, det_h) = (det_w as f64, det_h as f64);

        let ref_hash = pyramid::reference_hash(&detection_map);
        let pyramid =
            FeaturePyramid::load_or_build(&config.pyramid_cache_path, ref_hash, &detection_map, &config.level_specs)?;

        let transform = CoordinateTransform::from_control_points(&config.control_points)?;

        let cascade = build_cascade(&config.level_specs, &config.cascade_overrides);
        let tracker = matching::TranslationTracker::new(0.25);
        let coordinator = MatchingCoordinator::new(config.coordinator, cascade, tracker, det_w, det_h);

        Ok(Self {
            detection_map: Arc::new(detection_map),
            pyramid: Arc::new(pyramid),
            transform: Arc::new(transform),
            collectibles: Arc::new(CollectibleStore::new(config.collectibles)),
            bus: Arc::new(ViewportBus::new()),
            metrics: Arc::new(Metrics::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            coordinator: Arc::new(Mutex::new(coordinator)),
            frame_processor: Arc::new(Mutex::new(FrameProcessor::new())),
            scheduler_stats: Arc::new(Mutex::new(scheduler::SchedulerStats {
                target_fps: config.initial_target_fps,
                utilization: 0.0,
                frame_index: 0,
            })),
            initial_target_fps: config.initial_target_fps,
            min_fps: config.min_fps,
            max_fps: config.max_fps,
            capture: Arc::new(Mutex::new(capture)),
            det_w,
            det_h,
        })
    }

    pub fn detection_map(&self) -> &image::GrayImage {
        &self.detection_map
    }

    pub fn transform(&self) -> &CoordinateTransform {
        &self.transform
    }

    /// Detection-space dimensions of the loaded reference/detection map.
    pub fn detection_dims(&self) -> (f64, f64) {
        (self.det_w, self.det_h)
    }

    pub fn bus(&self) -> Arc<ViewportBus> {
        self.bus.clone()
    }

    /// `get_latest()` — the bus (spec.md §6).
    pub fn get_latest(&self) -> Option<Arc<Published>> {
        self.bus.get_latest()
    }

    /// `subscribe()` — a stream of subsequent publications (spec.md §6).
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<Arc<Published>> {
        self.bus.subscribe()
    }

    /// `reset_tracking()` — forces the coordinator's lost state (spec.md §6).
    pub fn reset_tracking(&self) {
        self.coordinator.lock().reset_tracking();
    }

    /// `reload_collectibles(list)` — swaps the immutable collectibles
    /// reference (spec.md §6). At most one in-flight tick may still see
    /// the stale list, per the idempotence law in spec.md §8.
    pub fn reload_collectibles(&self, list: Vec<Collectible>) {
        self.collectibles.reload(list);
    }

    /// `get_stats()` — read-only metrics (spec.md §6).
    pub fn get_stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot(*self.scheduler_stats.lock())
    }

    /// `match_once(frame)` — synchronous, used for manual alignment
    /// requests (spec.md §6). Runs a full-map cascade match directly,
    /// bypassing the motion-only/ROI fast paths and without touching the
    /// coordinator's tracked state, so it is safe to call concurrently
    /// with the running producer loop's own matching.
    pub fn match_once(&self, query_det: &image::GrayImage) -> Result<Option<MatchResult>> {
        let coordinator = self.coordinator.lock();
        coordinator.match_full_stateless(query_det, &self.pyramid)
    }

    /// Run one producer tick: capture, process, match, publish. Returns
    /// the `Skip` reason when nothing was published this tick.
    fn tick(&self) -> Result<std::result::Result<(), Skip>> {
        let tick_start = std::time::Instant::now();
        let mut processor_guard = self.frame_processor.lock();

        let capture_start = std::time::Instant::now();
        let processed = {
            let mut capture = self.capture.lock();
            processor_guard.process(&mut **capture)?
        };
        let capture_ms = capture_start.elapsed().as_secs_f64() * 1000.0;

        let processed = match processed {
            Ok(p) => p,
            Err(skip) => {
                match skip {
                    Skip::Duplicate => self.metrics.record_duplicate(),
                    Skip::MapHidden => self.metrics.record_map_hidden(),
                    Skip::TransientCapture | Skip::OutOfOrder | Skip::Lost => {
                        self.metrics.record_tick(None, None, TickTiming { capture_ms, match_ms: 0.0, total_ms: tick_start.elapsed().as_secs_f64() * 1000.0 });
                    }
                }
                return Ok(Err(skip));
            }
        };

        let match_start = std::time::Instant::now();
        let outcome = {
            let mut coordinator = self.coordinator.lock();
            coordinator.process(&processed.query, &self.pyramid)?
        };
        let match_ms = match_start.elapsed().as_secs_f64() * 1000.0;
        let total_ms = tick_start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            matching::CoordinatorOutcome::Matched(result) => {
                let method = result.method;
                let level_used = result.level_used.clone();
                self.publish(result, processed.captured_at_ms);
                self.metrics.record_tick(
                    Some(method),
                    level_used.as_deref(),
                    TickTiming { capture_ms, match_ms, total_ms },
                );
                Ok(Ok(()))
            }
            matching::CoordinatorOutcome::Lost => {
                self.metrics.record_tick(Some(MatchMethod::Lost), None, TickTiming { capture_ms, match_ms, total_ms });
                Ok(Err(Skip::Lost))
            }
        }
    }

    fn publish(&self, result: MatchResult, captured_at_ms: i64) {
        let collectibles = self.collectibles.current();
        let collectibles_in_view = collectibles::collectibles_in_view(
            &collectibles,
            result.viewport,
            CROP,
            SOURCE_W,
            SOURCE_H,
        );
        self.bus.publish(Published {
            viewport: result.viewport,
            confidence: result.confidence,
            method: result.method,
            timestamp_ms: captured_at_ms,
            collectibles_in_view,
        });
    }

    /// `start()` — spawns the producer thread running the adaptive
    /// scheduler; returns a handle the caller can `join` after `stop()`
    /// (spec.md §4.H, §6).
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let state = self.clone();
        let cancel = self.cancel.clone();
        let initial_target_fps = self.initial_target_fps;
        let min_fps = self.min_fps;
        let max_fps = self.max_fps;
        std::thread::spawn(move || {
            let mut scheduler = AdaptiveScheduler::with_bounds(initial_target_fps, min_fps, max_fps, cancel);
            scheduler.run(|stats| {
                *state.scheduler_stats.lock() = *stats;
                if let Err(e) = state.tick() {
                    tracing::error!(error = %e, "producer tick failed, continuing");
                }
            });
        })
    }

    /// `stop()` — sets the cooperative cancellation flag; the producer
    /// exits on the next tick boundary (spec.md §4.H, §5).
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}
