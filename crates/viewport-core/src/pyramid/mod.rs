//! Component B — Feature Pyramid Cache (spec.md §4.B).

mod spatial_index;

pub use spatial_index::GridIndex;

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

use crate::cv_backend::{self, Descriptors, Keypoint};
use crate::error::{Error, Result};

/// Bump whenever the build algorithm, preprocessing, or on-disk layout
/// changes, so stale caches are rebuilt instead of misread.
pub const PYRAMID_VERSION: u32 = 1;

/// One configured scale level of the pyramid, e.g. `{0.125, 0.25, 0.5}`.
#[derive(Debug, Clone, Copy)]
pub struct LevelSpec {
    pub scale: f64,
    pub feature_budget: usize,
    pub name: &'static str,
}

pub fn default_level_specs() -> Vec<LevelSpec> {
    vec![
        LevelSpec { scale: 0.125, feature_budget: 4000, name: "coarse" },
        LevelSpec { scale: 0.25, feature_budget: 8000, name: "medium" },
        LevelSpec { scale: 0.5, feature_budget: 16000, name: "fine" },
    ]
}

/// Keypoint coordinates are stored in detection space at every level
/// (spec.md invariant I-3), already rescaled back up from the resized
/// image they were extracted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedLevel {
    scale: f64,
    name: String,
    feature_budget: usize,
    keypoints: Vec<(f64, f64, f32)>,
    descriptor_rows: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheHeader {
    ref_hash: [u8; 32],
    pyramid_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedPyramid {
    header: CacheHeader,
    levels: Vec<SerializedLevel>,
}

pub struct PyramidLevel {
    pub scale: f64,
    pub name: &'static str,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
    pub index: GridIndex,
}

impl PyramidLevel {
    /// Restrict candidate reference keypoints to those inside `roi`
    /// (spec.md §4.C step 2), returning their descriptors alongside their
    /// original indices so matches can be mapped back to keypoints.
    pub fn descriptors_in_roi(&self, roi: viewport_types::Viewport) -> Result<(Vec<usize>, Descriptors)> {
        let indices: Vec<usize> = self.index.query_roi(roi).into_iter().map(|i| i as usize).collect();
        let desc = self.descriptors.row_subset(&indices)?;
        Ok((indices, desc))
    }
}

pub struct FeaturePyramid {
    pub levels: Vec<PyramidLevel>,
}

/// Spatial-distribution grid used for `extract_akaze`'s per-cell cap; see
/// spec.md §4.C step 1 (`G ~= 50`). The pyramid build uses a coarser grid
/// since it is extracting many more features over a much larger image.
const PYRAMID_EXTRACTION_GRID: u32 = 64;
const INDEX_CELL_SIZE_PX: f64 = 128.0;

impl FeaturePyramid {
    /// Build the pyramid from scratch (spec.md §4.B steps 1-5). A build
    /// failure is fatal to startup (spec.md §4.B Failures).
    pub fn build(detection_map: &image::GrayImage, levels: &[LevelSpec]) -> Result<Self> {
        let mut out = Vec::with_capacity(levels.len());
        for spec in levels {
            tracing::info!(scale = spec.scale, name = spec.name, "building feature pyramid level");
            let resized = cv_backend::resize_area(detection_map, spec.scale)?;
            let preprocessed = cv_backend::preprocess(&resized)?;
            let (resized_kps, descriptors) =
                cv_backend::extract_akaze(&preprocessed, spec.feature_budget, PYRAMID_EXTRACTION_GRID)?;

            // Rescale keypoint coordinates back into detection space
            // (spec.md §4.B step 4).
            let keypoints: Vec<Keypoint> = resized_kps
                .into_iter()
                .map(|kp| Keypoint {
                    x: kp.x / spec.scale,
                    y: kp.y / spec.scale,
                    response: kp.response,
                })
                .collect();

            if keypoints.is_empty() {
                return Err(Error::PyramidBuild(format!(
                    "level {} produced zero keypoints",
                    spec.name
                )));
            }

            let coords: Vec<(f64, f64)> = keypoints.iter().map(|k| (k.x, k.y)).collect();
            let index = GridIndex::build(&coords, INDEX_CELL_SIZE_PX);

            out.push(PyramidLevel {
                scale: spec.scale,
                name: spec.name,
                keypoints,
                descriptors,
                index,
            });
        }
        Ok(Self { levels: out })
    }

    /// Load from an on-disk cache file if its header matches
    /// `(ref_hash, PYRAMID_VERSION)`, otherwise build fresh and persist
    /// (spec.md §4.B persistence/failures).
    pub fn load_or_build(
        cache_path: &Path,
        ref_hash: [u8; 32],
        detection_map: &image::GrayImage,
        levels: &[LevelSpec],
    ) -> Result<Self> {
        match Self::try_load(cache_path, ref_hash, levels) {
            Ok(Some(pyramid)) => {
                tracing::info!(path = %cache_path.display(), "loaded feature pyramid cache");
                return Ok(pyramid);
            }
            Ok(None) => {
                tracing::info!("no matching pyramid cache found, rebuilding");
            }
            Err(e) => {
                tracing::warn!(error = %e, "pyramid cache corrupted, discarding and rebuilding");
            }
        }

        let pyramid = Self::build(detection_map, levels)?;
        if let Err(e) = pyramid.save(cache_path, ref_hash) {
            tracing::warn!(error = %e, "failed to persist rebuilt pyramid cache");
        }
        Ok(pyramid)
    }

    fn try_load(cache_path: &Path, ref_hash: [u8; 32], levels: &[LevelSpec]) -> Result<Option<Self>> {
        if !cache_path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        std::fs::File::open(cache_path)?.read_to_end(&mut buf)?;
        let serialized: SerializedPyramid = bincode::deserialize(&buf)?;

        if serialized.header.ref_hash != ref_hash
            || serialized.header.pyramid_version != PYRAMID_VERSION
            || serialized.levels.len() != levels.len()
        {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(serialized.levels.len());
        for level in serialized.levels {
            let keypoints: Vec<Keypoint> = level
                .keypoints
                .iter()
                .map(|&(x, y, response)| Keypoint { x, y, response })
                .collect();
            let coords: Vec<(f64, f64)> = keypoints.iter().map(|k| (k.x, k.y)).collect();
            let index = GridIndex::build(&coords, INDEX_CELL_SIZE_PX);
            let descriptors = Descriptors::from_rows(&level.descriptor_rows)?;
            out.push(PyramidLevel {
                scale: level.scale,
                name: Box::leak(level.name.into_boxed_str()),
                keypoints,
                descriptors,
                index,
            });
        }
        Ok(Some(Self { levels: out }))
    }

    fn save(&self, cache_path: &Path, ref_hash: [u8; 32]) -> Result<()> {
        let mut levels = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            levels.push(SerializedLevel {
                scale: level.scale,
                name: level.name.to_string(),
                feature_budget: level.keypoints.len(),
                keypoints: level.keypoints.iter().map(|k| (k.x, k.y, k.response)).collect(),
                descriptor_rows: level.descriptors.to_rows()?,
            });
        }
        let serialized = SerializedPyramid {
            header: CacheHeader { ref_hash, pyramid_version: PYRAMID_VERSION },
            levels,
        };
        let bytes = bincode::serialize(&serialized)?;
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(cache_path)?.write_all(&bytes)?;
        Ok(())
    }
}

/// Content hash of the reference image bytes, used as the cache key
/// together with `PYRAMID_VERSION` (spec.md §4.B persistence).
pub fn reference_hash(detection_map: &image::GrayImage) -> [u8; 32] {
    *blake3::hash(detection_map.as_raw()).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn synthetic_map(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let v = ((x * 37 + y * 101) % 256) as u8;
            Luma([v])
        })
    }

    #[test]
    fn cache_round_trip_preserves_hash_key() {
        let map = synthetic_map(512, 512);
        let hash_a = reference_hash(&map);
        let hash_b = reference_hash(&map);
        assert_eq!(hash_a, hash_b);

        let other = synthetic_map(513, 512);
        assert_ne!(hash_a, reference_hash(&other));
    }
}
