//! Frame sampling and per-frame descriptor extraction.
//!
//! A video is reduced to one [Fingerprint] per sampled frame:
//!
//! 1. A [FrameSource] (usually a [VideoFile]) yields source frames at their native rate
//! 2. The [Sampler] picks frames at a fixed target rate and has them decoded to grayscale
//!    at a fixed size, skipping the rest
//! 3. [descriptor::extract] turns each sampled frame into 8 gradient-orientation centroids
use std::path::Path;

use image::GrayImage;

use crate::Result;

mod decoder;
pub mod descriptor;
mod sampler;

pub use decoder::VideoFile;
pub use descriptor::{extract, extract_fingerprint};
pub use sampler::{decide, Sampler};

/// Number of block rows in the descriptor grid.
pub const GRID_ROWS: usize = 2;

/// Number of block columns in the descriptor grid.
pub const GRID_COLS: usize = 4;

/// Number of values in a [Fingerprint].
pub const FINGERPRINT_LEN: usize = GRID_ROWS * GRID_COLS;

/// Descriptor of a single sampled frame: one orientation centroid per grid block,
/// in row-major order. Every value lies in `[-π, π]`.
pub type Fingerprint = [f64; FINGERPRINT_LEN];

/// A source of video frames, such as a decoded video file.
///
/// Frames are consumed strictly in order. For each frame the caller either asks for
/// the image ([FrameSource::decode]) or throws it away ([FrameSource::skip]); skipping
/// must not pay for pixel conversion or resizing.
pub trait FrameSource {
    /// Native frame rate of the source, in frames per second.
    fn frame_rate(&self) -> f64;

    /// Path (or description) of the source, used for errors and logs.
    fn path(&self) -> &Path;

    /// Advances past the next frame. Returns `false` once the source is exhausted.
    fn skip(&mut self) -> Result<bool>;

    /// Returns the next frame as a grayscale image of exactly `size` (width, height),
    /// or `None` once the source is exhausted.
    fn decode(&mut self, size: (u32, u32)) -> Result<Option<GrayImage>>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn frame_rate(&self) -> f64 {
        (**self).frame_rate()
    }

    fn path(&self) -> &Path {
        (**self).path()
    }

    fn skip(&mut self) -> Result<bool> {
        (**self).skip()
    }

    fn decode(&mut self, size: (u32, u32)) -> Result<Option<GrayImage>> {
        (**self).decode(size)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use image::{imageops, GrayImage, Luma};

    use super::FrameSource;
    use crate::{Error, Result};

    /// In-memory [FrameSource] used by tests in place of a real video file.
    pub(crate) struct SyntheticVideo {
        path: PathBuf,
        fps: f64,
        frames: Vec<GrayImage>,
        pos: usize,
        fail_at: Option<usize>,
        pub(crate) decoded: Vec<usize>,
        pub(crate) skipped: usize,
    }

    impl SyntheticVideo {
        pub(crate) fn new(name: &str, fps: f64, frames: Vec<GrayImage>) -> Self {
            Self {
                path: PathBuf::from(name),
                fps,
                frames,
                pos: 0,
                fail_at: None,
                decoded: Vec::new(),
                skipped: 0,
            }
        }

        /// A video where every frame is the same flat gray.
        pub(crate) fn static_gray(name: &str, fps: f64, seconds: f64, level: u8) -> Self {
            let count = (fps * seconds).round() as usize;
            let frame = GrayImage::from_pixel(320, 240, Luma([level]));
            Self::new(name, fps, vec![frame; count])
        }

        /// A 320x240 video whose frames are linear ramps with a per-frame direction of
        /// `2.4 * sin(0.37 t² + phase * t + phase)`. No two windows of a few frames look
        /// alike, so a sub-clip only matches at its own offset.
        pub(crate) fn textured(name: &str, fps: f64, count: usize, phase: f64) -> Self {
            let frames = (0..count)
                .map(|t| {
                    let t = t as f64;
                    ramp(2.4 * f64::sin(0.37 * t * t + phase * t + phase))
                })
                .collect();
            Self::new(name, fps, frames)
        }

        /// Makes the source fail with a decode error when frame `idx` is reached.
        pub(crate) fn failing_at(mut self, idx: usize) -> Self {
            self.fail_at = Some(idx);
            self
        }

        fn advance(&mut self) -> Result<Option<usize>> {
            if self.fail_at == Some(self.pos) {
                return Err(Error::FFmpegError(ffmpeg_next::Error::InvalidData));
            }
            if self.pos >= self.frames.len() {
                return Ok(None);
            }
            self.pos += 1;
            Ok(Some(self.pos - 1))
        }
    }

    pub(crate) fn ramp(phi: f64) -> GrayImage {
        let (c, s) = (phi.cos(), phi.sin());
        GrayImage::from_fn(320, 240, |x, y| {
            let v = 128.0 + 0.6 * (c * (x as f64 - 160.0) + s * (y as f64 - 120.0));
            Luma([v.round().clamp(0.0, 255.0) as u8])
        })
    }

    impl FrameSource for SyntheticVideo {
        fn frame_rate(&self) -> f64 {
            self.fps
        }

        fn path(&self) -> &Path {
            &self.path
        }

        fn skip(&mut self) -> Result<bool> {
            let next = self.advance()?;
            if next.is_some() {
                self.skipped += 1;
            }
            Ok(next.is_some())
        }

        fn decode(&mut self, (width, height): (u32, u32)) -> Result<Option<GrayImage>> {
            let idx = match self.advance()? {
                Some(idx) => idx,
                None => return Ok(None),
            };
            self.decoded.push(idx);
            let frame = &self.frames[idx];
            if frame.dimensions() == (width, height) {
                Ok(Some(frame.clone()))
            } else {
                Ok(Some(imageops::resize(
                    frame,
                    width,
                    height,
                    imageops::FilterType::Triangle,
                )))
            }
        }
    }
}
