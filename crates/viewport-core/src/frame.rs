//! Component G — Frame Processor (spec.md §4.G).

use image::{GrayImage, RgbImage};

use crate::cv_backend;
use crate::error::{Result, Skip};

/// Fraction of the captured frame height kept before matching, cropping
/// out the bottom HUD strip.
pub const CROP: f64 = 0.8;

/// A screen capture plus its capture instant. Host-provided.
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
}

/// Implemented by the host; the one capture dependency the core consumes
/// (spec.md §6).
pub trait CaptureSource: Send {
    fn capture(&mut self) -> Result<CapturedFrame>;
}

/// Output of a successful frame-processing pass: a preprocessed grayscale
/// query image ready for matching, plus its capture timestamp.
pub struct ProcessedFrame {
    pub query: GrayImage,
    pub captured_at_ms: i64,
}

/// Subsampling stride for the duplicate-frame digest; cheap enough to run
/// every tick, dense enough that two visually different frames almost
/// never collide.
const DIGEST_STRIDE: usize = 7;

fn content_digest(img: &RgbImage) -> [u8; 16] {
    let mut sample = Vec::new();
    for (i, px) in img.pixels().enumerate() {
        if i % DIGEST_STRIDE == 0 {
            sample.extend_from_slice(&px.0);
        }
    }
    let full = blake3::hash(&sample);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full.as_bytes()[..16]);
    out
}

/// Pure function over cropped pixel statistics; returns whether the
/// minimap is visible. Treats the whole cropped frame as one region and
/// reports it hidden when its sampled luminance variance is near zero
/// (solid color, e.g. a loading screen) — there is no per-region
/// minimap configuration, just this one whole-frame check.
pub fn map_visible(cropped: &RgbImage) -> bool {
    let mut sum = 0u64;
    let mut sum_sq = 0u64;
    let mut n = 0u64;
    for px in cropped.pixels().step_by(DIGEST_STRIDE) {
        let lum = (px.0[0] as u64 * 299 + px.0[1] as u64 * 587 + px.0[2] as u64 * 114) / 1000;
        sum += lum;
        sum_sq += lum * lum;
        n += 1;
    }
    if n == 0 {
        return false;
    }
    let mean = sum as f64 / n as f64;
    let variance = (sum_sq as f64 / n as f64) - mean * mean;
    variance > 4.0
}

/// Drives capture, deduplication, HUD cropping, map-visibility gating, and
/// the shared grayscale preprocessing pipeline.
pub struct FrameProcessor {
    last_digest: Option<[u8; 16]>,
    last_capture_ms: Option<i64>,
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self { last_digest: None, last_capture_ms: None }
    }

    pub fn process(&mut self, source: &mut dyn CaptureSource) -> Result<std::result::Result<ProcessedFrame, Skip>> {
        // A capture failure (window not ready, frame dropped) is always a
        // transient, per-tick condition (spec.md §7), never propagated as
        // a fatal error — only startup failures are fatal.
        let captured = match source.capture() {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "transient capture error");
                return Ok(Err(Skip::TransientCapture));
            }
        };

        if let Some(last) = self.last_capture_ms {
            if captured.captured_at_ms <= last {
                return Ok(Err(Skip::OutOfOrder));
            }
        }

        let digest = content_digest(&captured.image);
        if self.last_digest == Some(digest) {
            return Ok(Err(Skip::Duplicate));
        }
        self.last_digest = Some(digest);
        self.last_capture_ms = Some(captured.captured_at_ms);

        let (w, h) = captured.image.dimensions();
        let cropped_h = ((h as f64) * CROP).round() as u32;
        let cropped = image::imageops::crop_imm(&captured.image, 0, 0, w, cropped_h).to_image();

        if !map_visible(&cropped) {
            return Ok(Err(Skip::MapHidden));
        }

        let gray = image::DynamicImage::ImageRgb8(cropped).to_luma8();
        let query = cv_backend::preprocess(&gray)?;

        Ok(Ok(ProcessedFrame { query, captured_at_ms: captured.captured_at_ms }))
    }
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct FixedSource {
        frames: Vec<(RgbImage, i64)>,
        idx: usize,
    }

    impl CaptureSource for FixedSource {
        fn capture(&mut self) -> Result<CapturedFrame> {
            let (image, captured_at_ms) = self.frames[self.idx.min(self.frames.len() - 1)].clone();
            self.idx += 1;
            Ok(CapturedFrame { image, captured_at_ms })
        }
    }

    fn lively_frame(seed: u8) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x.wrapping_mul(13) ^ y.wrapping_mul(7) ^ seed as u32) % 256) as u8;
            Rgb([v, v.wrapping_add(40), v.wrapping_add(80)])
        })
    }

    fn dark_frame() -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([2, 2, 2]))
    }

    #[test]
    fn duplicate_frame_is_skipped() {
        let frame = lively_frame(1);
        let mut source = FixedSource { frames: vec![(frame.clone(), 1000), (frame, 1001)], idx: 0 };
        let mut fp = FrameProcessor::new();
        assert!(fp.process(&mut source).unwrap().is_ok());
        assert!(matches!(fp.process(&mut source).unwrap(), Err(Skip::Duplicate)));
    }

    #[test]
    fn dark_frame_is_map_hidden() {
        let mut source = FixedSource { frames: vec![(dark_frame(), 1000)], idx: 0 };
        let mut fp = FrameProcessor::new();
        assert!(matches!(fp.process(&mut source).unwrap(), Err(Skip::MapHidden)));
    }

    #[test]
    fn out_of_order_capture_is_dropped() {
        let mut source = FixedSource {
            frames: vec![(lively_frame(1), 2000), (lively_frame(2), 1500)],
            idx: 0,
        };
        let mut fp = FrameProcessor::new();
        assert!(fp.process(&mut source).unwrap().is_ok());
        assert!(matches!(fp.process(&mut source).unwrap(), Err(Skip::OutOfOrder)));
    }
}
