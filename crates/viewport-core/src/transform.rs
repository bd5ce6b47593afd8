//! Component A — Coordinate Transform (spec.md §4.A).
//!
//! Pure, allocation-free, total functions on the hot path. Calibration
//! control points are loaded once at startup; the transformer is
//! immutable thereafter, exactly as `braid-april-cal` treats a camera
//! calibration once it has converged.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub const DETECTION_SCALE: f64 = 0.5;

/// One geodetic control point: a known (lat, lng) paired with its pixel
/// location on the reference map.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlPoint {
    pub lat: f64,
    pub lng: f64,
    pub ref_x: f64,
    pub ref_y: f64,
}

/// An affine map `(lat, lng) -> (ref_x, ref_y)` fit by least squares
/// through a set of control points, plus its closed-form inverse.
#[derive(Debug, Clone, Copy)]
struct AffineFit {
    // forward: ref = a*lat + b*lng + c, ref_y = d*lat + e*lng + f
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    // inverse, fit independently by solving the same normal equations
    // with inputs/outputs swapped (cheaper and numerically nicer than
    // inverting the forward 2x2 block directly when points are noisy).
    ia: f64,
    ib: f64,
    ic: f64,
    id: f64,
    ie: f64,
    if_: f64,
    /// RMS residual of the forward fit, in reference-map pixels.
    residual_px: f64,
}

fn fit_affine(xs: &[(f64, f64)], ys: &[(f64, f64)]) -> crate::error::Result<AffineFit> {
    assert!(xs.len() >= 3, "need at least 3 control points to fit an affine map");
    assert_eq!(xs.len(), ys.len());

    let n = xs.len();
    let mut design = DMatrix::<f64>::zeros(n, 3);
    for (i, (p, q)) in xs.iter().enumerate() {
        design[(i, 0)] = *p;
        design[(i, 1)] = *q;
        design[(i, 2)] = 1.0;
    }

    let target_x = DVector::<f64>::from_iterator(n, ys.iter().map(|(rx, _)| *rx));
    let target_y = DVector::<f64>::from_iterator(n, ys.iter().map(|(_, ry)| *ry));

    let svd = design.clone().svd(true, true);
    let coeffs_x = svd.solve(&target_x, 1e-12).map_err(|e| {
        crate::error::Error::InvalidCalibration(format!(
            "control points are degenerate (e.g. collinear), cannot fit x coefficients: {e}"
        ))
    })?;
    let coeffs_y = svd.solve(&target_y, 1e-12).map_err(|e| {
        crate::error::Error::InvalidCalibration(format!(
            "control points are degenerate (e.g. collinear), cannot fit y coefficients: {e}"
        ))
    })?;

    let (a, b, c) = (coeffs_x[0], coeffs_x[1], coeffs_x[2]);
    let (d, e, f) = (coeffs_y[0], coeffs_y[1], coeffs_y[2]);

    let mut sq_err = 0.0;
    for (i, (p, q)) in xs.iter().enumerate() {
        let (rx, ry) = ys[i];
        let px = a * p + b * q + c;
        let py = d * p + e * q + f;
        sq_err += (px - rx).powi(2) + (py - ry).powi(2);
    }
    let residual_px = (sq_err / n as f64).sqrt();

    // Fit the inverse map ref -> (lat, lng) the same way, swapping roles.
    let svd_inv = {
        let mut design_inv = DMatrix::<f64>::zeros(n, 3);
        for (i, (rx, ry)) in ys.iter().enumerate() {
            design_inv[(i, 0)] = *rx;
            design_inv[(i, 1)] = *ry;
            design_inv[(i, 2)] = 1.0;
        }
        design_inv.svd(true, true)
    };
    let target_lat = DVector::<f64>::from_iterator(n, xs.iter().map(|(lat, _)| *lat));
    let target_lng = DVector::<f64>::from_iterator(n, xs.iter().map(|(_, lng)| *lng));
    let coeffs_lat = svd_inv.solve(&target_lat, 1e-12).map_err(|e| {
        crate::error::Error::InvalidCalibration(format!(
            "control points are degenerate (e.g. collinear), cannot fit inverse lat coefficients: {e}"
        ))
    })?;
    let coeffs_lng = svd_inv.solve(&target_lng, 1e-12).map_err(|e| {
        crate::error::Error::InvalidCalibration(format!(
            "control points are degenerate (e.g. collinear), cannot fit inverse lng coefficients: {e}"
        ))
    })?;

    Ok(AffineFit {
        a,
        b,
        c,
        d,
        e,
        f,
        ia: coeffs_lat[0],
        ib: coeffs_lat[1],
        ic: coeffs_lat[2],
        id: coeffs_lng[0],
        ie: coeffs_lng[1],
        if_: coeffs_lng[2],
        residual_px,
    })
}

/// Immutable, total bijection between geographic coordinates, reference-map
/// pixels, and detection-space pixels. Built once at startup from a set of
/// calibration control points.
#[derive(Debug, Clone)]
pub struct CoordinateTransform {
    fit: AffineFit,
}

impl CoordinateTransform {
    /// Build the transformer from at least 3 calibration control points.
    pub fn from_control_points(points: &[ControlPoint]) -> crate::error::Result<Self> {
        if points.len() < 3 {
            return Err(crate::error::Error::InvalidCalibration(format!(
                "need at least 3 control points, got {}",
                points.len()
            )));
        }
        let xs: Vec<(f64, f64)> = points.iter().map(|p| (p.lat, p.lng)).collect();
        let ys: Vec<(f64, f64)> = points.iter().map(|p| (p.ref_x, p.ref_y)).collect();
        Ok(Self {
            fit: fit_affine(&xs, &ys)?,
        })
    }

    /// RMS residual of the forward fit, in reference-map pixels. Used by the
    /// round-trip testable property (spec.md §8) to bound tolerable drift.
    pub fn calibration_residual_px(&self) -> f64 {
        self.fit.residual_px
    }

    #[inline]
    pub fn latlng_to_ref(&self, lat: f64, lng: f64) -> (f64, f64) {
        let f = &self.fit;
        (f.a * lat + f.b * lng + f.c, f.d * lat + f.e * lng + f.f)
    }

    #[inline]
    pub fn ref_to_latlng(&self, rx: f64, ry: f64) -> (f64, f64) {
        let f = &self.fit;
        (f.ia * rx + f.ib * ry + f.ic, f.id * rx + f.ie * ry + f.if_)
    }

    #[inline]
    pub fn ref_to_det(rx: f64, ry: f64) -> (f64, f64) {
        (rx * DETECTION_SCALE, ry * DETECTION_SCALE)
    }

    #[inline]
    pub fn det_to_ref(dx: f64, dy: f64) -> (f64, f64) {
        (dx / DETECTION_SCALE, dy / DETECTION_SCALE)
    }

    /// Scale a detection-space rectangle into source-image pixels, undoing
    /// the top-fraction HUD crop (spec.md §4.A).
    pub fn det_viewport_to_screen(
        v: viewport_types::Viewport,
        crop: f64,
        src_w: f64,
        src_h: f64,
        det_w: f64,
        det_h: f64,
    ) -> viewport_types::Viewport {
        let cropped_src_h = src_h * crop;
        let sx = src_w / det_w;
        let sy = cropped_src_h / det_h;
        viewport_types::Viewport {
            x: v.x * sx,
            y: v.y * sy,
            w: v.w * sx,
            h: v.h * sy,
        }
    }

    /// Transform a single detection-space point into source-image pixels,
    /// undoing the HUD crop. Used to project collectibles into screen space.
    pub fn det_point_to_screen(
        dx: f64,
        dy: f64,
        crop: f64,
        src_w: f64,
        src_h: f64,
        det_w: f64,
        det_h: f64,
    ) -> (f64, f64) {
        let cropped_src_h = src_h * crop;
        let sx = src_w / det_w;
        let sy = cropped_src_h / det_h;
        (dx * sx, dy * sy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> Vec<ControlPoint> {
        // A pure affine relationship lat/lng -> ref pixels, exactly
        // recoverable: ref_x = 1000*lat + 200, ref_y = -1000*lng + 400.
        let mut pts = Vec::new();
        for (lat, lng) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (0.5, 0.25)] {
            pts.push(ControlPoint {
                lat,
                lng,
                ref_x: 1000.0 * lat + 200.0,
                ref_y: -1000.0 * lng + 400.0,
            });
        }
        pts
    }

    #[test]
    fn round_trip_within_residual() {
        let xform = CoordinateTransform::from_control_points(&sample_points()).unwrap();
        assert!(xform.calibration_residual_px() < 1e-6);

        for (lat, lng) in [(0.3, 0.7), (0.9, 0.1), (0.5, 0.5)] {
            let (rx, ry) = xform.latlng_to_ref(lat, lng);
            let (lat2, lng2) = xform.ref_to_latlng(rx, ry);
            assert!((lat - lat2).abs() < 1e-6);
            assert!((lng - lng2).abs() < 1e-6);
        }
    }

    #[test]
    fn ref_to_det_halves_coordinates() {
        let (dx, dy) = CoordinateTransform::ref_to_det(2000.0, 4000.0);
        assert_eq!(dx, 1000.0);
        assert_eq!(dy, 2000.0);
        let (rx, ry) = CoordinateTransform::det_to_ref(dx, dy);
        assert_eq!(rx, 2000.0);
        assert_eq!(ry, 4000.0);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let pts = vec![
            ControlPoint { lat: 0.0, lng: 0.0, ref_x: 0.0, ref_y: 0.0 },
            ControlPoint { lat: 1.0, lng: 0.0, ref_x: 1.0, ref_y: 0.0 },
        ];
        assert!(CoordinateTransform::from_control_points(&pts).is_err());
    }

    #[test]
    fn collinear_points_are_an_error_not_a_panic() {
        // All control points lie on the line lat == lng, so the design
        // matrix is rank-deficient — an operator who clicks 3+ points
        // without enough spatial spread hits this at startup.
        let pts = vec![
            ControlPoint { lat: 0.0, lng: 0.0, ref_x: 0.0, ref_y: 0.0 },
            ControlPoint { lat: 1.0, lng: 1.0, ref_x: 100.0, ref_y: 100.0 },
            ControlPoint { lat: 2.0, lng: 2.0, ref_x: 200.0, ref_y: 200.0 },
        ];
        assert!(CoordinateTransform::from_control_points(&pts).is_err());
    }
}
