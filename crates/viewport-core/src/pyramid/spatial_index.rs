//! Grid-bucketed spatial index over detection-space keypoint coordinates
//! (spec.md §4.B step 5). Deliberately a flat grid rather than an R-tree:
//! keypoint density is roughly uniform per reference-map tile and a grid
//! bucket lookup is O(1) versus O(log n) for a tree, which matters on the
//! matching hot path.

use viewport_types::Viewport;

#[derive(Debug, Clone)]
pub struct GridIndex {
    cell_size: f64,
    cols: u32,
    rows: u32,
    origin_x: f64,
    origin_y: f64,
    buckets: Vec<Vec<u32>>,
}

impl GridIndex {
    /// Build an index over `points` (detection-space coordinates), using a
    /// cell size tuned so each bucket holds a handful of points on average.
    pub fn build(points: &[(f64, f64)], cell_size: f64) -> Self {
        let cell_size = cell_size.max(1.0);
        if points.is_empty() {
            return Self {
                cell_size,
                cols: 1,
                rows: 1,
                origin_x: 0.0,
                origin_y: 0.0,
                buckets: vec![Vec::new()],
            };
        }

        let (mut min_x, mut min_y, mut max_x, mut max_y) =
            (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let cols = (((max_x - min_x) / cell_size).floor() as u32 + 1).max(1);
        let rows = (((max_y - min_y) / cell_size).floor() as u32 + 1).max(1);

        let mut buckets = vec![Vec::new(); (cols * rows) as usize];
        for (i, &(x, y)) in points.iter().enumerate() {
            let cx = (((x - min_x) / cell_size).floor() as u32).min(cols - 1);
            let cy = (((y - min_y) / cell_size).floor() as u32).min(rows - 1);
            buckets[(cy * cols + cx) as usize].push(i as u32);
        }

        Self {
            cell_size,
            cols,
            rows,
            origin_x: min_x,
            origin_y: min_y,
            buckets,
        }
    }

    fn cell_of(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        let fx = (x - self.origin_x) / self.cell_size;
        let fy = (y - self.origin_y) / self.cell_size;
        if fx < 0.0 || fy < 0.0 {
            return None;
        }
        let cx = fx.floor() as u32;
        let cy = fy.floor() as u32;
        if cx >= self.cols || cy >= self.rows {
            return None;
        }
        Some((cx, cy))
    }

    /// Indices of all points whose cell falls inside `roi`, found by
    /// walking the bucket rectangle covering `roi` and excluding it there
    /// is no narrower per-point containment check (each bucket is small
    /// relative to a typical ROI margin, so the overcount is negligible).
    pub fn query_roi(&self, roi: Viewport) -> Vec<u32> {
        let top_left = self.cell_of(roi.x, roi.y);
        let bottom_right = self.cell_of(roi.x + roi.w, roi.y + roi.h);

        let (cx0, cy0) = top_left.unwrap_or((0, 0));
        let (cx1, cy1) = bottom_right.unwrap_or((self.cols - 1, self.rows - 1));

        let cx0 = cx0.min(self.cols - 1);
        let cy0 = cy0.min(self.rows - 1);
        let cx1 = cx1.min(self.cols - 1).max(cx0);
        let cy1 = cy1.min(self.rows - 1).max(cy0);

        let mut out = Vec::new();
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                out.extend_from_slice(&self.buckets[(cy * self.cols + cx) as usize]);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_points_inside_roi() {
        let points = vec![(10.0, 10.0), (500.0, 500.0), (505.0, 505.0), (2000.0, 2000.0)];
        let index = GridIndex::build(&points, 64.0);

        let roi = Viewport::new(400.0, 400.0, 200.0, 200.0);
        let mut hits = index.query_roi(roi);
        hits.sort();
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = GridIndex::build(&[], 64.0);
        assert!(index.query_roi(Viewport::new(0.0, 0.0, 100.0, 100.0)).is_empty());
    }
}
