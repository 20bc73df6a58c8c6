//! Gradient-orientation centroid descriptor.
//!
//! Horizontal and vertical first derivatives are taken with a `[-1, 0, 1]` kernel and
//! reflect-101 borders (the edge pixel mirrors its inner neighbour, so derivatives across
//! the frame border are zero). Each pixel contributes its orientation `atan2(gy, gx)`
//! weighted by its magnitude `sqrt(gx² + gy²)` to the block it falls in.
//!
//! The frame is split into a 2x4 grid of `height / 2` by `width / 4` blocks. Rows and
//! columns left over by the integer division belong to no block, although they still
//! take part in the derivatives of their neighbours.
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use image::GrayImage;

use super::{Fingerprint, FINGERPRINT_LEN, GRID_COLS, GRID_ROWS};

// Index of the neighbour at `i - 1` / `i + 1`, mirrored at the borders without repeating
// the border pixel itself.
#[inline(always)]
fn reflect_101(i: usize, len: usize) -> (usize, usize) {
    let prev = if i == 0 { 1.min(len - 1) } else { i - 1 };
    let next = if i + 1 == len { len.saturating_sub(2) } else { i + 1 };
    (prev, next)
}

/// Computes the fingerprint of a single grayscale frame.
pub fn extract_fingerprint(frame: &GrayImage) -> Fingerprint {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let pixels = frame.as_raw();
    let px = |x: usize, y: usize| pixels[y * width + x] as f64;

    let (block_h, block_w) = (height / GRID_ROWS, width / GRID_COLS);
    let mut fingerprint = [0.0; FINGERPRINT_LEN];

    for n in 0..GRID_ROWS {
        for m in 0..GRID_COLS {
            let mut numerator = 0.0;
            let mut denominator = 0.0;

            for y in n * block_h..(n + 1) * block_h {
                let (up, down) = reflect_101(y, height);
                for x in m * block_w..(m + 1) * block_w {
                    let (left, right) = reflect_101(x, width);
                    let gx = px(right, y) - px(left, y);
                    let gy = px(x, down) - px(x, up);

                    let magnitude = f64::sqrt(gx * gx + gy * gy);
                    let orientation = f64::atan2(gy, gx);
                    numerator += magnitude * orientation;
                    denominator += magnitude;
                }
            }

            // A flat block has no orientation to speak of.
            fingerprint[n * GRID_COLS + m] = if denominator == 0.0 {
                0.0
            } else {
                numerator / denominator
            };
        }
    }

    fingerprint
}

/// Computes one fingerprint per frame, in order.
pub fn extract(frames: &[GrayImage]) -> Vec<Fingerprint> {
    let span = tracing::span!(tracing::Level::TRACE, "extract", frames = frames.len());
    let _enter = span.enter();

    #[cfg(feature = "rayon")]
    let fingerprints = frames.par_iter().map(extract_fingerprint).collect();
    #[cfg(not(feature = "rayon"))]
    let fingerprints = frames.iter().map(extract_fingerprint).collect();

    fingerprints
}

#[cfg(test)]
mod test {
    use std::f64::consts::{FRAC_PI_2, PI};

    use image::Luma;

    use super::*;
    use crate::video::testing::ramp;

    #[test]
    fn test_flat_frame_is_all_zero() {
        for level in [0u8, 128, 255] {
            let frame = GrayImage::from_pixel(320, 240, Luma([level]));
            assert_eq!(extract_fingerprint(&frame), [0.0; 8]);
        }
    }

    #[test]
    fn test_flat_block_among_textured_blocks() {
        // Vertical ramp on the left half, flat on the right. The last column of blocks
        // sees no gradient at all.
        let frame = GrayImage::from_fn(320, 240, |x, y| {
            Luma([if x < 160 { y as u8 } else { 200 }])
        });
        let fp = extract_fingerprint(&frame);
        assert_eq!(fp[3], 0.0);
        assert_eq!(fp[7], 0.0);
        assert!((fp[0] - FRAC_PI_2).abs() < 1e-9, "{}", fp[0]);
        assert!((fp[4] - FRAC_PI_2).abs() < 1e-9, "{}", fp[4]);
    }

    #[test]
    fn test_vertical_ramp_points_down() {
        let frame = GrayImage::from_fn(320, 240, |_, y| Luma([y as u8]));
        let fp = extract_fingerprint(&frame);
        for v in fp {
            assert!((v - FRAC_PI_2).abs() < 1e-9, "{}", v);
        }
    }

    #[test]
    fn test_decreasing_ramp_is_pi() {
        let frame = GrayImage::from_fn(320, 240, |x, _| Luma([255 - (x / 2) as u8]));
        let fp = extract_fingerprint(&frame);
        for v in fp {
            assert!((v - PI).abs() < 1e-9, "{}", v);
        }
    }

    #[test]
    fn test_values_within_range() {
        for phi in [-2.4, -1.0, 0.3, 1.7, 2.4] {
            for v in extract_fingerprint(&ramp(phi)) {
                assert!((-PI..=PI).contains(&v));
            }
        }
    }

    #[test]
    fn test_remainder_pixels_are_dropped() {
        // 9x5 frame: blocks are 2x2, so column 8 and row 4 belong to no block. Their
        // content must not change the fingerprint beyond what border neighbours see.
        let base = GrayImage::from_fn(9, 5, |x, y| Luma([(x * 10 + y * 3) as u8]));
        let mut altered = base.clone();
        // Pixels not adjacent to any block pixel.
        altered.put_pixel(8, 4, Luma([0]));
        assert_eq!(extract_fingerprint(&base), extract_fingerprint(&altered));

        // Changing a remainder pixel next to a block does change the derivative there.
        altered.put_pixel(8, 0, Luma([255]));
        assert_ne!(extract_fingerprint(&base), extract_fingerprint(&altered));
    }

    #[test]
    fn test_deterministic() {
        let frames: Vec<GrayImage> = [0.1, -1.2, 2.0].iter().map(|p| ramp(*p)).collect();
        let first = extract(&frames);
        let second = extract(&frames);
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().flatten().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.iter().flatten().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }
}
