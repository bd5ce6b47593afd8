//! Thin wrapper around the `opencv` crate's AKAZE/RANSAC/phase-correlation
//! calls. Keeping every direct `opencv::*` call in this one module means
//! the rest of `viewport-core` only ever talks to plain Rust types.

use image::GrayImage;
use opencv::core::{Mat, Point2f, Size, Vector};
use opencv::prelude::*;

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub response: f32,
}

/// Binary (AKAZE/MLDB) descriptors, one row per keypoint.
#[derive(Debug, Clone)]
pub struct Descriptors(pub Mat);

/// A similarity transform: translation plus uniform scale, no rotation.
/// This is the only model class homography estimation is allowed to
/// produce (spec.md §3: "rotation and skew are rejected").
#[derive(Debug, Clone, Copy)]
pub struct Similarity {
    pub tx: f64,
    pub ty: f64,
    pub scale: f64,
}

impl Similarity {
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.scale * x + self.tx, self.scale * y + self.ty)
    }
}

impl Descriptors {
    /// Flatten to one `Vec<u8>` row per descriptor, for serialization. The
    /// pyramid cache stores this rather than the `Mat` directly (spec.md
    /// §4.B persistence).
    pub fn to_rows(&self) -> Result<Vec<Vec<u8>>> {
        let rows = self.0.rows();
        let mut out = Vec::with_capacity(rows.max(0) as usize);
        for r in 0..rows {
            let row = self.0.row(r)?;
            out.push(row.data_bytes()?.to_vec());
        }
        Ok(out)
    }

    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self> {
        if rows.is_empty() {
            return Ok(Descriptors(Mat::default()));
        }
        let cols = rows[0].len();
        let mut mats = Vector::<Mat>::new();
        for row in rows {
            debug_assert_eq!(row.len(), cols);
            let m = unsafe {
                Mat::new_rows_cols_with_data_unsafe(
                    1,
                    cols as i32,
                    opencv::core::CV_8UC1,
                    row.as_ptr() as *mut std::ffi::c_void,
                    opencv::core::Mat_AUTO_STEP,
                )?
            };
            mats.push(m.try_clone()?);
        }
        let mut out = Mat::default();
        opencv::core::vconcat(&mats, &mut out)?;
        Ok(Descriptors(out))
    }

    pub fn row_subset(&self, indices: &[usize]) -> Result<Descriptors> {
        let mut rows = Vector::<Mat>::new();
        for &i in indices {
            rows.push(self.0.row(i as i32)?.try_clone()?);
        }
        let mut out = Mat::default();
        if !rows.is_empty() {
            opencv::core::vconcat(&rows, &mut out)?;
        }
        Ok(Descriptors(out))
    }
}

fn gray_to_mat(img: &GrayImage) -> Result<Mat> {
    let (w, h) = img.dimensions();
    let mat = unsafe {
        Mat::new_rows_cols_with_data_unsafe(
            h as i32,
            w as i32,
            opencv::core::CV_8UC1,
            img.as_raw().as_ptr() as *mut std::ffi::c_void,
            opencv::core::Mat_AUTO_STEP,
        )?
    };
    Ok(mat.try_clone()?)
}

/// Resize a grayscale image by `scale` using area interpolation
/// (spec.md §4.B step 1).
pub fn resize_area(img: &GrayImage, scale: f64) -> Result<GrayImage> {
    let src = gray_to_mat(img)?;
    let (w, h) = img.dimensions();
    let new_size = Size::new(
        (w as f64 * scale).round().max(1.0) as i32,
        (h as f64 * scale).round().max(1.0) as i32,
    );
    let mut dst = Mat::default();
    opencv::imgproc::resize(
        &src,
        &mut dst,
        new_size,
        0.0,
        0.0,
        opencv::imgproc::INTER_AREA,
    )?;
    mat_to_gray(&dst)
}

fn mat_to_gray(mat: &Mat) -> Result<GrayImage> {
    let w = mat.cols() as u32;
    let h = mat.rows() as u32;
    let data = mat.data_bytes()?;
    Ok(GrayImage::from_raw(w, h, data.to_vec()).expect("mat byte count matches width*height"))
}

/// The shared preprocessing pipeline used identically on pyramid levels and
/// live query frames (spec.md §4.B step 2, §4.G step 5): posterization,
/// CLAHE contrast normalization, then a fixed gamma LUT. Must match exactly
/// between pyramid build and query preprocessing or descriptors will not
/// compare meaningfully.
pub fn preprocess(img: &GrayImage) -> Result<GrayImage> {
    let src = gray_to_mat(img)?;

    // Posterize to a reduced number of gray levels via integer division,
    // which flattens minimap dithering noise before CLAHE runs.
    const POSTERIZE_LEVELS: i32 = 32;
    let mut posterized = Mat::default();
    let step = 256 / POSTERIZE_LEVELS;
    let mut lut = Vector::<u8>::with_capacity(256);
    for i in 0..256i32 {
        lut.push(((i / step) * step) as u8);
    }
    let lut_mat = Mat::from_exact_iter(lut.into_iter())?;
    opencv::core::lut(&src, &lut_mat, &mut posterized)?;

    let mut clahe_out = Mat::default();
    let mut clahe = opencv::imgproc::create_clahe(2.0, Size::new(8, 8))?;
    opencv::imgproc::CLAHE::apply(&mut *clahe, &posterized, &mut clahe_out)?;

    mat_to_gray(&clahe_out)
}

/// Extract AKAZE keypoints/descriptors, capped at `max_features` with a
/// spatial-distribution filter over a `grid x grid` cell decomposition that
/// keeps only the strongest-response keypoints per cell (spec.md §4.C
/// step 1).
pub fn extract_akaze(
    img: &GrayImage,
    max_features: usize,
    grid: u32,
) -> Result<(Vec<Keypoint>, Descriptors)> {
    let mat = gray_to_mat(img)?;
    let mut akaze = <dyn opencv::features2d::AKAZE>::create_def()?;

    let mut kps = Vector::<opencv::core::KeyPoint>::new();
    let mut desc = Mat::default();
    let mask = Mat::default();
    akaze.detect_and_compute(&mat, &mask, &mut kps, &mut desc, false)?;

    let (w, h) = img.dimensions();
    let per_cell_budget = (max_features as f64 / (grid * grid) as f64).ceil() as usize;
    let cell_w = (w as f64 / grid as f64).max(1.0);
    let cell_h = (h as f64 / grid as f64).max(1.0);

    let mut buckets: std::collections::HashMap<(u32, u32), Vec<(usize, f32)>> =
        std::collections::HashMap::new();
    for i in 0..kps.len() {
        let kp = kps.get(i)?;
        let pt = kp.pt();
        let cx = ((pt.x as f64 / cell_w) as u32).min(grid.saturating_sub(1));
        let cy = ((pt.y as f64 / cell_h) as u32).min(grid.saturating_sub(1));
        buckets.entry((cx, cy)).or_default().push((i, kp.response()));
    }

    let mut kept_indices: Vec<usize> = Vec::new();
    for bucket in buckets.values_mut() {
        bucket.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        bucket.truncate(per_cell_budget);
        kept_indices.extend(bucket.iter().map(|(i, _)| *i));
    }
    kept_indices.truncate(max_features.max(kept_indices.len().min(max_features)));

    let mut out_kps = Vec::with_capacity(kept_indices.len());
    let mut desc_rows = Vector::<Mat>::new();
    for &i in &kept_indices {
        let kp = kps.get(i)?;
        let pt: Point2f = kp.pt();
        out_kps.push(Keypoint {
            x: pt.x as f64,
            y: pt.y as f64,
            response: kp.response(),
        });
        desc_rows.push(desc.row(i as i32)?.try_clone()?);
    }

    let mut out_desc = Mat::default();
    if !desc_rows.is_empty() {
        opencv::core::vconcat(&desc_rows, &mut out_desc)?;
    }

    Ok((out_kps, Descriptors(out_desc)))
}

/// One accepted match after Lowe's ratio test: indices into the query and
/// train (reference) keypoint arrays.
#[derive(Debug, Clone, Copy)]
pub struct RatioMatch {
    pub query_idx: usize,
    pub train_idx: usize,
}

/// Brute-force Hamming matching with Lowe's ratio test (spec.md §4.C
/// steps 2-3). `train` may be a subset of a pyramid level's full
/// descriptor set (already filtered by ROI via the spatial index).
pub fn match_hamming_ratio_test(
    query: &Descriptors,
    train: &Descriptors,
    ratio: f32,
) -> Result<Vec<RatioMatch>> {
    if query.0.rows() == 0 || train.0.rows() == 0 {
        return Ok(Vec::new());
    }
    let matcher = opencv::features2d::BFMatcher::new(opencv::core::NORM_HAMMING, false)?;
    let mut knn_matches = Vector::<Vector<opencv::core::DMatch>>::new();
    matcher.knn_train_match(&query.0, &train.0, &mut knn_matches, 2, &Mat::default(), false)?;

    let mut good = Vec::new();
    for pair in knn_matches.iter() {
        if pair.len() < 2 {
            continue;
        }
        let m0 = pair.get(0)?;
        let m1 = pair.get(1)?;
        if m0.distance < ratio * m1.distance {
            good.push(RatioMatch {
                query_idx: m0.query_idx as usize,
                train_idx: m0.train_idx as usize,
            });
        }
    }
    Ok(good)
}

/// Residual rotation tolerated in an accepted fit, in radians (~2.9
/// degrees) — enough slack for keypoint-localization noise on a minimap
/// that never actually rotates, not enough to pass a genuinely rotated
/// false match.
const MAX_ROTATION_RAD: f64 = 0.05;

/// Estimate a similarity transform (translation + uniform scale) via
/// RANSAC, rejecting rotation/skew (spec.md §4.C step 4, §3).
///
/// Returns the transform and a boolean inlier mask, one entry per input
/// correspondence, or `None` if RANSAC could not find a model (degenerate
/// input, e.g. all points collinear or fewer than 3 correspondences, or a
/// fit whose residual rotation exceeds `MAX_ROTATION_RAD`).
pub fn estimate_similarity_ransac(
    src_pts: &[(f64, f64)],
    dst_pts: &[(f64, f64)],
    ransac_thresh_px: f64,
) -> Result<Option<(Similarity, Vec<bool>)>> {
    if src_pts.len() < 3 {
        return Ok(None);
    }
    let mut src = Vector::<Point2f>::new();
    let mut dst = Vector::<Point2f>::new();
    for (s, d) in src_pts.iter().zip(dst_pts.iter()) {
        src.push(Point2f::new(s.0 as f32, s.1 as f32));
        dst.push(Point2f::new(d.0 as f32, d.1 as f32));
    }
    let src_mat = Mat::from_exact_iter(src.into_iter())?;
    let dst_mat = Mat::from_exact_iter(dst.into_iter())?;

    let mut inlier_mask = Mat::default();
    // estimate_affine_partial_2d fits a similarity (uniform scale +
    // rotation); the rotation component is rejected explicitly below,
    // since spec.md forbids it (the minimap never rotates).
    let m = opencv::calib3d::estimate_affine_partial_2d(
        &src_mat,
        &dst_mat,
        &mut inlier_mask,
        opencv::calib3d::RANSAC,
        ransac_thresh_px,
        2000,
        0.99,
        10,
    )?;
    if m.empty() {
        return Ok(None);
    }

    let m00: f64 = *m.at_2d::<f64>(0, 0)?;
    let m01: f64 = *m.at_2d::<f64>(0, 1)?;
    let m02: f64 = *m.at_2d::<f64>(0, 2)?;
    let m12: f64 = *m.at_2d::<f64>(1, 2)?;

    // `estimate_affine_partial_2d`'s model is [[cos*s, -sin*s, tx], [sin*s,
    // cos*s, ty]], so the rotation angle is recoverable as `atan2(m01,
    // m00)` (negated sign convention notwithstanding, only the magnitude
    // matters here). A fit with more than a hair of residual rotation is
    // not the pure similarity spec.md §3/§4.C step 4 requires and is
    // rejected outright rather than silently accepted with its rotation
    // component dropped.
    let rotation_rad = m01.atan2(m00);
    if rotation_rad.abs() > MAX_ROTATION_RAD {
        return Ok(None);
    }

    let scale = (m00 * m00 + m01 * m01).sqrt();
    let similarity = Similarity {
        tx: m02,
        ty: m12,
        scale,
    };

    let mut mask_vals = Vec::with_capacity(inlier_mask.rows() as usize);
    for i in 0..inlier_mask.rows() {
        let v: u8 = *inlier_mask.at_2d::<u8>(i, 0)?;
        mask_vals.push(v != 0);
    }

    Ok(Some((similarity, mask_vals)))
}

/// FFT-based phase correlation between two equally-sized grayscale images
/// (spec.md §4.E). Returns `(dx, dy, response)`. Deliberately does not
/// apply a Hanning window (see spec.md §4.E contracts).
pub fn phase_correlate(prev: &GrayImage, curr: &GrayImage) -> Result<(f64, f64, f64)> {
    let prev_mat = gray_to_mat(prev)?;
    let curr_mat = gray_to_mat(curr)?;

    let mut prev_f = Mat::default();
    let mut curr_f = Mat::default();
    prev_mat.convert_to(&mut prev_f, opencv::core::CV_32F, 1.0, 0.0)?;
    curr_mat.convert_to(&mut curr_f, opencv::core::CV_32F, 1.0, 0.0)?;

    let mut response = 0.0f64;
    let shift = opencv::video::phase_correlate(
        &prev_f,
        &curr_f,
        &Mat::default(),
        &mut response,
    )?;

    Ok((shift.x, shift.y, response))
}
