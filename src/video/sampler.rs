use std::path::Path;
use std::time::Instant;

use image::GrayImage;

use super::{FrameSource, VideoFile, GRID_COLS, GRID_ROWS};
use crate::{Error, Result};

/// Returns `true` if the source frame at `source_index` should be decoded, given that
/// `output_index` frames have been produced so far and that `step` source frames make
/// up one output frame.
///
/// `step` may be fractional; output frame `n` is taken from the first source frame at or
/// after `n * step`.
#[inline]
pub fn decide(source_index: u64, output_index: u64, step: f64) -> bool {
    source_index as f64 >= output_index as f64 * step
}

/// Samples a [FrameSource] at a fixed rate, producing grayscale frames of a fixed size.
///
/// The output rate is independent of the source frame rate. Frames that fall between
/// two samples are skipped without being converted.
///
/// # Example
///
/// ```
/// use clipseek::video::Sampler;
///
/// let sampler = Sampler::default().with_target_fps(5.0);
/// let frames = sampler.sample_file("clip.mp4").unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Sampler {
    target_fps: f64,
    target_size: (u32, u32),
    threaded_decoding: bool,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            target_fps: crate::DEFAULT_TARGET_FPS,
            target_size: crate::DEFAULT_TARGET_SIZE,
            threaded_decoding: false,
        }
    }
}

impl Sampler {
    /// Returns a new [Sampler] with the provided `target_fps`.
    pub fn with_target_fps(mut self, target_fps: f64) -> Self {
        self.target_fps = target_fps;
        self
    }

    /// Returns a new [Sampler] with the provided `target_size` (width, height).
    pub fn with_target_size(mut self, target_size: (u32, u32)) -> Self {
        self.target_size = target_size;
        self
    }

    /// Returns a new [Sampler] with `threaded_decoding` set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded_decoding: bool) -> Self {
        self.threaded_decoding = threaded_decoding;
        self
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    pub fn target_size(&self) -> (u32, u32) {
        self.target_size
    }

    pub fn threaded_decoding(&self) -> bool {
        self.threaded_decoding
    }

    /// Checks that the rate is positive and that frames are large enough to hold at least
    /// one pixel per descriptor block.
    pub fn validate(&self) -> Result<()> {
        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "target_fps must be a positive number, got {}",
                self.target_fps
            )));
        }
        let (width, height) = self.target_size;
        if (width as usize) < GRID_COLS || (height as usize) < GRID_ROWS {
            return Err(Error::InvalidConfig(format!(
                "target_size must be at least {}x{}, got {}x{}",
                GRID_COLS, GRID_ROWS, width, height
            )));
        }
        // Sequence headers store each dimension as a u16.
        if width > u32::from(u16::MAX) || height > u32::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "target_size must be at most {}x{}, got {}x{}",
                u16::MAX,
                u16::MAX,
                width,
                height
            )));
        }
        Ok(())
    }

    /// Opens `path` with FFmpeg and samples it.
    pub fn sample_file(&self, path: impl AsRef<Path>) -> Result<Vec<GrayImage>> {
        let mut video = VideoFile::open(path, self.threaded_decoding)?;
        self.sample(&mut video)
    }

    /// Samples frames from `source` until it is exhausted.
    ///
    /// A read failure before the first sampled frame is reported as
    /// [Error::SourceUnreadable]. A read failure after that ends the stream early and the
    /// frames gathered so far are returned. An empty result means the source opened but
    /// held no frames.
    pub fn sample<S: FrameSource>(&self, mut source: S) -> Result<Vec<GrayImage>> {
        self.validate()?;

        let span = tracing::span!(tracing::Level::TRACE, "sample");
        let _enter = span.enter();
        let started = Instant::now();

        let source_fps = source.frame_rate();
        let mut step = source_fps / self.target_fps;
        if !step.is_finite() || step <= 0.0 {
            tracing::warn!(
                source_fps,
                "unusable source frame rate for {}, decoding every frame",
                source.path().display()
            );
            step = 1.0;
        }

        tracing::debug!(
            step,
            "processing 1 out of every {:.2} frames of {}",
            step,
            source.path().display()
        );

        let mut frames = Vec::new();
        let mut source_index: u64 = 0;

        loop {
            let output_index = frames.len() as u64;
            let read = if decide(source_index, output_index, step) {
                source.decode(self.target_size).map(|frame| match frame {
                    Some(frame) => {
                        frames.push(frame);
                        true
                    }
                    None => false,
                })
            } else {
                source.skip()
            };

            match read {
                Ok(true) => (),
                Ok(false) => break,
                Err(e) if frames.is_empty() => {
                    return Err(Error::SourceUnreadable {
                        path: source.path().to_owned(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        source_index,
                        "stopping early at unreadable frame of {}: {}",
                        source.path().display(),
                        e
                    );
                    break;
                }
            }

            source_index += 1;
        }

        tracing::debug!(
            frames = frames.len(),
            source_frames = source_index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sampled {}",
            source.path().display()
        );

        Ok(frames)
    }
}
