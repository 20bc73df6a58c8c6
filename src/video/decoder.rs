extern crate ffmpeg_next;

use std::path::{Path, PathBuf};

use image::GrayImage;

use super::FrameSource;
use crate::{Error, Result};

/// Thin wrapper around the native `FFmpeg` video decoder.
struct Decoder {
    decoder: ffmpeg_next::codec::decoder::Video,
    scaler: Option<(
        ffmpeg_next::software::scaling::context::Context,
        (u32, u32),
    )>,
}

impl Decoder {
    fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
        let mut config = ffmpeg_next::codec::threading::Config::default();
        config.count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        config.kind = ffmpeg_next::codec::threading::Type::Frame;
        config
    }

    fn from_stream(stream: ffmpeg_next::format::stream::Stream, threaded: bool) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let mut decoder = ctx.decoder();

        if threaded {
            decoder.set_threading(Self::build_threading_config());
        }

        Ok(Self {
            decoder: decoder.video()?,
            scaler: None,
        })
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::packet::Packet) -> Result<()> {
        Ok(self.decoder.send_packet(packet)?)
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(self.decoder.send_eof()?)
    }

    // Returns `Ok(false)` if the decoder needs more input or has been fully drained.
    fn receive_frame(&mut self, frame: &mut ffmpeg_next::frame::Video) -> Result<bool> {
        match self.decoder.receive_frame(frame) {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // Converts the frame to GRAY8 at the given size. Area averaging is used when
    // shrinking, which avoids aliasing from dropped pixels.
    fn scale(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        size: (u32, u32),
        scaled: &mut ffmpeg_next::frame::Video,
    ) -> Result<()> {
        let stale = match &self.scaler {
            Some((_, s)) => *s != size,
            None => true,
        };
        if stale {
            let ctx = ffmpeg_next::software::scaling::context::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_next::format::Pixel::GRAY8,
                size.0,
                size.1,
                ffmpeg_next::software::scaling::flag::Flags::AREA,
            )?;
            self.scaler = Some((ctx, size));
        }

        if let Some((scaler, _)) = &mut self.scaler {
            match scaler.run(frame, scaled) {
                Ok(()) => (),
                // The input geometry changed mid-stream. Build a new scaler for this frame
                // and swap out the cached one.
                Err(ffmpeg_next::Error::InputChanged) => {
                    self.scaler = None;
                    return self.scale(frame, size, scaled);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

/// A video file opened with FFmpeg, exposed as a [FrameSource].
///
/// Only the best video stream is read. Every packet is still fed to the decoder, since
/// skipped frames may be references for the frames that follow, but skipped frames are
/// never converted or scaled.
pub struct VideoFile {
    path: PathBuf,
    ctx: ffmpeg_next::format::context::Input,
    decoder: Decoder,
    stream_idx: usize,
    frame_rate: f64,
    frame: ffmpeg_next::frame::Video,
    scaled: ffmpeg_next::frame::Video,
    eof_sent: bool,
}

impl VideoFile {
    /// Opens `path` and prepares a decoder for its best video stream.
    pub fn open(path: impl AsRef<Path>, threaded_decoding: bool) -> Result<Self> {
        let path = path.as_ref();
        let unreadable = |reason: String| Error::SourceUnreadable {
            path: path.to_owned(),
            reason,
        };

        let ctx = ffmpeg_next::format::input(&path).map_err(|e| unreadable(e.to_string()))?;
        let stream = ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| unreadable("no video stream found".to_string()))?;
        let stream_idx = stream.index();

        // Prefer the average frame rate; some containers only fill in the base rate.
        let mut frame_rate = f64::from(stream.avg_frame_rate());
        if !frame_rate.is_finite() || frame_rate <= 0.0 {
            frame_rate = f64::from(stream.rate());
        }

        let decoder =
            Decoder::from_stream(stream, threaded_decoding).map_err(|e| unreadable(e.to_string()))?;

        tracing::debug!(
            stream_idx,
            frame_rate,
            "opened video stream in {}",
            path.display()
        );

        Ok(Self {
            path: path.to_owned(),
            ctx,
            decoder,
            stream_idx,
            frame_rate,
            frame: ffmpeg_next::frame::Video::empty(),
            scaled: ffmpeg_next::frame::Video::empty(),
            eof_sent: false,
        })
    }

    // Pulls the next decoded frame into `self.frame`, reading packets as needed.
    fn next_frame(&mut self) -> Result<bool> {
        loop {
            if self.decoder.receive_frame(&mut self.frame)? {
                return Ok(true);
            }
            if self.eof_sent {
                return Ok(false);
            }

            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(&mut self.ctx) {
                Ok(()) => {
                    if packet.stream() == self.stream_idx {
                        self.decoder.send_packet(&packet)?;
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Copies the plane of a GRAY8 frame into an image, dropping any row padding.
    fn to_image(frame: &ffmpeg_next::frame::Video) -> Option<GrayImage> {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let stride = frame.stride(0);
        let data = frame.data(0);
        let mut buf = Vec::with_capacity(width * height);
        for row in 0..height {
            buf.extend_from_slice(&data[row * stride..row * stride + width]);
        }
        GrayImage::from_raw(width as u32, height as u32, buf)
    }
}

impl FrameSource for VideoFile {
    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn skip(&mut self) -> Result<bool> {
        self.next_frame()
    }

    fn decode(&mut self, size: (u32, u32)) -> Result<Option<GrayImage>> {
        if !self.next_frame()? {
            return Ok(None);
        }
        self.decoder.scale(&self.frame, size, &mut self.scaled)?;
        Self::to_image(&self.scaled)
            .map(Some)
            .ok_or_else(|| Error::SourceUnreadable {
                path: self.path.clone(),
                reason: "scaled frame has an unexpected layout".to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    fn get_sample_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("resources")
            .join("sample-5s.mp4")
    }

    #[test]
    fn test_open_missing_file() {
        let err = VideoFile::open("/nonexistent/clip.mp4", false).err().unwrap();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
    }

    #[test]
    #[ignore = "needs resources/sample-5s.mp4"]
    fn test_decode_sample() {
        let mut video = VideoFile::open(get_sample_path(), false).unwrap();
        assert!(video.frame_rate() > 0.0);
        let frame = video.decode((320, 240)).unwrap().unwrap();
        assert_eq!(frame.dimensions(), (320, 240));
        assert!(video.skip().unwrap());
    }
}
