//! Collectible filtering: projects the external, immutable collectible
//! list into the set currently inside the published viewport, in
//! source-image screen-space coordinates (spec.md §6 wire format).
//!
//! Ingestion itself — where the list comes from — is out of scope
//! (spec.md §1); the core only holds the latest list by reference and
//! filters/transforms it each tick.

use std::sync::Arc;

use parking_lot::RwLock;
use viewport_types::{CollectibleInView, Viewport};

use crate::transform::CoordinateTransform;

/// One collectible, per the external ingestion interface (spec.md §6).
/// `det_x`/`det_y` are detection-space floats, not reference-map pixels:
/// the source's `map_x`/`map_y` carry no explicit scale annotation
/// (spec.md's open question on this), and the spec fixes them as
/// detection-space — no further conversion happens before filtering.
#[derive(Debug, Clone)]
pub struct Collectible {
    pub det_x: f64,
    pub det_y: f64,
    pub category: String,
    pub payload: String,
}

/// Holds the current immutable collectible list behind a swappable
/// `Arc`, so `reload_collectibles` never blocks a concurrent filter pass
/// (readers see either the old or the new list in full, never a mix).
pub struct CollectibleStore {
    current: RwLock<Arc<Vec<Collectible>>>,
}

impl CollectibleStore {
    pub fn new(initial: Vec<Collectible>) -> Self {
        Self { current: RwLock::new(Arc::new(initial)) }
    }

    pub fn reload(&self, list: Vec<Collectible>) {
        *self.current.write() = Arc::new(list);
    }

    pub fn current(&self) -> Arc<Vec<Collectible>> {
        self.current.read().clone()
    }
}

/// Filters collectibles whose detection-space position falls inside
/// `viewport` and projects the survivors into source-image (screen)
/// pixel space, with the HUD crop undone, exactly as the wire format at
/// the HTTP/WebSocket boundary requires (spec.md §6).
pub fn collectibles_in_view(
    collectibles: &[Collectible],
    viewport: Viewport,
    crop: f64,
    src_w: f64,
    src_h: f64,
) -> Vec<CollectibleInView> {
    let mut out = Vec::new();
    for c in collectibles {
        let (dx, dy) = (c.det_x, c.det_y);
        if dx < viewport.x || dx > viewport.x + viewport.w || dy < viewport.y || dy > viewport.y + viewport.h {
            continue;
        }
        // Position relative to the viewport's own origin, then scaled as
        // if the viewport itself were resized to fill the (cropped)
        // source image — the viewport's content IS what the player sees.
        let local_x = dx - viewport.x;
        let local_y = dy - viewport.y;
        let (screen_x, screen_y) = CoordinateTransform::det_point_to_screen(
            local_x,
            local_y,
            crop,
            src_w,
            src_h,
            viewport.w,
            viewport.h,
        );
        out.push(CollectibleInView {
            screen_x: screen_x as f32,
            screen_y: screen_y as f32,
            category: c.category.clone(),
            payload_ref: c.payload.clone(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectible_inside_viewport_is_kept_and_projected() {
        let collectibles = vec![Collectible {
            det_x: 1000.0,
            det_y: 1000.0,
            category: "shard".to_string(),
            payload: "shard-1".to_string(),
        }];
        // A 2000x1600 detection-space viewport at the origin covers (1000, 1000).
        let viewport = Viewport::new(0.0, 0.0, 2000.0, 1600.0);
        let out = collectibles_in_view(&collectibles, viewport, 0.8, 1920.0, 1080.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, "shard");
        assert!(out[0].screen_x >= 0.0 && out[0].screen_x <= 1920.0);
    }

    #[test]
    fn collectible_outside_viewport_is_dropped() {
        let collectibles = vec![Collectible {
            det_x: 40000.0,
            det_y: 40000.0,
            category: "shard".to_string(),
            payload: "far".to_string(),
        }];
        let viewport = Viewport::new(0.0, 0.0, 2000.0, 1600.0);
        let out = collectibles_in_view(&collectibles, viewport, 0.8, 1920.0, 1080.0);
        assert!(out.is_empty());
    }

    #[test]
    fn reload_replaces_the_list_atomically() {
        let store = CollectibleStore::new(vec![]);
        assert!(store.current().is_empty());
        store.reload(vec![Collectible {
            det_x: 0.0,
            det_y: 0.0,
            category: "x".to_string(),
            payload: "y".to_string(),
        }]);
        assert_eq!(store.current().len(), 1);
    }
}
