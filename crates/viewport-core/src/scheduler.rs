//! Component H — Capture Loop / Adaptive Scheduler (spec.md §4.H).
//!
//! Runs on its own `std::thread`, not on the async runtime the HTTP
//! surface uses: matching is CPU-bound and synchronous, so a dedicated OS
//! thread with a plain sleep loop is simpler and cheaper than parking a
//! tokio task for most of every tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ring of the last `W` processing-time samples (spec.md §4.H step 3).
const RING_SIZE: usize = 10;
/// Adapt every `E` frames (spec.md §4.H step 5).
const ADAPT_EVERY: u64 = 3;
const MIN_TARGET_FPS: f64 = 5.0;

struct SampleRing {
    samples: [Duration; RING_SIZE],
    len: usize,
    next: usize,
}

impl SampleRing {
    fn new() -> Self {
        Self { samples: [Duration::ZERO; RING_SIZE], len: 0, next: 0 }
    }

    fn push(&mut self, d: Duration) {
        self.samples[self.next] = d;
        self.next = (self.next + 1) % RING_SIZE;
        self.len = (self.len + 1).min(RING_SIZE);
    }

    /// 90th percentile of the filled portion of the ring.
    fn p90(&self) -> Duration {
        if self.len == 0 {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.samples[..self.len].to_vec();
        sorted.sort();
        let idx = ((self.len as f64) * 0.9).ceil() as usize;
        sorted[idx.saturating_sub(1).min(self.len - 1)]
    }
}

/// Scheduler state exposed to the metrics aggregator.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub target_fps: f64,
    pub utilization: f64,
    pub frame_index: u64,
}

pub struct AdaptiveScheduler {
    target_fps: f64,
    min_fps: f64,
    max_fps: Option<f64>,
    ring: SampleRing,
    frames_since_adapt: u64,
    frame_index: u64,
    last_utilization: f64,
    cancel: Arc<AtomicBool>,
}

impl AdaptiveScheduler {
    pub fn new(initial_target_fps: f64, cancel: Arc<AtomicBool>) -> Self {
        Self::with_bounds(initial_target_fps, MIN_TARGET_FPS, None, cancel)
    }

    /// Builds a scheduler with an explicit `[min_fps, max_fps]` clamp
    /// range, per spec.md §4.H step 5 ("Clamp `target_fps ∈ [5, ∞)`...
    /// optional ceiling").
    pub fn with_bounds(initial_target_fps: f64, min_fps: f64, max_fps: Option<f64>, cancel: Arc<AtomicBool>) -> Self {
        let min_fps = min_fps.max(0.1);
        let target_fps = initial_target_fps.max(min_fps);
        let target_fps = match max_fps {
            Some(max) => target_fps.min(max),
            None => target_fps,
        };
        Self {
            target_fps,
            min_fps,
            max_fps,
            ring: SampleRing::new(),
            frames_since_adapt: 0,
            frame_index: 0,
            last_utilization: 0.0,
            cancel,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            target_fps: self.target_fps,
            utilization: self.last_utilization,
            frame_index: self.frame_index,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }

    /// Record one tick's processing time and retune `target_fps` every
    /// `ADAPT_EVERY` frames per the exact thresholds in spec.md §4.H step 5.
    fn record_and_adapt(&mut self, processing_time: Duration) {
        self.ring.push(processing_time);
        self.frame_index += 1;
        self.frames_since_adapt += 1;

        let interval = self.frame_interval();
        let p90 = self.ring.p90();
        let u = p90.as_secs_f64() / interval.as_secs_f64();
        self.last_utilization = u;

        if self.frames_since_adapt < ADAPT_EVERY {
            return;
        }
        self.frames_since_adapt = 0;

        let multiplier = if u < 0.6 {
            1.5
        } else if u < 0.75 {
            1.2
        } else if u <= 0.85 {
            1.0
        } else {
            0.7
        };
        let mut next = (self.target_fps * multiplier).max(self.min_fps);
        if let Some(max) = self.max_fps {
            next = next.min(max);
        }
        self.target_fps = next;
    }

    /// Runs the producer loop: calls `tick` once per iteration, measures
    /// its cost, adapts `target_fps`, and sleeps to the next scheduled
    /// instant — or, if a tick overran badly, skips straight to "now"
    /// rather than bursting to catch up (spec.md §4.H step 6).
    pub fn run(&mut self, mut tick: impl FnMut(&SchedulerStats)) {
        let mut next_tick_at = Instant::now();

        loop {
            if self.cancel.load(Ordering::Acquire) {
                tracing::info!("scheduler received cancellation, exiting");
                return;
            }

            let t0 = Instant::now();
            tick(&self.stats());
            let processing_time = t0.elapsed();
            self.record_and_adapt(processing_time);

            let interval = self.frame_interval();
            next_tick_at += interval;

            let now = Instant::now();
            if now > next_tick_at + interval {
                // Overran by more than one interval: drop the backlog
                // instead of bursting through it.
                next_tick_at = now;
            }

            if next_tick_at > now {
                std::thread::sleep(next_tick_at - now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_band_holds_target_fps_steady() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut sched = AdaptiveScheduler::new(60.0, cancel);
        // frame_interval at 60fps ~= 16.67ms; pick a processing time whose
        // utilization lands inside [0.75, 0.85].
        let interval = sched.frame_interval();
        let processing = Duration::from_secs_f64(interval.as_secs_f64() * 0.8);

        let before = sched.target_fps;
        for _ in 0..(ADAPT_EVERY as usize * 3) {
            sched.record_and_adapt(processing);
        }
        assert!((sched.target_fps - before).abs() < 1e-6);
    }

    #[test]
    fn ramps_up_when_underutilized() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut sched = AdaptiveScheduler::new(5.0, cancel);
        for _ in 0..30 {
            sched.record_and_adapt(Duration::from_millis(15));
        }
        assert!(sched.target_fps >= 50.0, "target_fps = {}", sched.target_fps);
        assert!(sched.last_utilization >= 0.75 && sched.last_utilization <= 0.85 + 0.05);
    }

    #[test]
    fn ramps_down_when_overloaded() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut sched = AdaptiveScheduler::new(60.0, cancel);
        for _ in 0..9 {
            sched.record_and_adapt(Duration::from_millis(50));
        }
        assert!(sched.target_fps < 60.0);
    }
}
