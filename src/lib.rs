use std::path::PathBuf;

pub mod search;
pub mod store;
pub mod util;
pub mod video;

pub use search::{MatchResult, Searcher};
pub use store::{CatalogueRecord, FingerprintRows, FingerprintStore, SequenceView};
pub use video::{Fingerprint, FrameSource, Sampler, VideoFile};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open/decode video source {path:?}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },
    #[error("no frames could be extracted from {0:?}")]
    EmptyExtraction(PathBuf),
    #[error("catalogue at {path:?} is corrupt: {source}")]
    CatalogueCorrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("fingerprint sequence for {id} not readable at {path:?}: {source}")]
    MissingSequenceFile {
        id: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid fingerprint sequence file {path:?}: {reason}")]
    InvalidSequenceFile { path: PathBuf, reason: String },
    #[error("video not found in catalogue: {0}")]
    UnknownVideo(String),
    #[error("query fingerprint sequence is empty")]
    EmptyQuery,
    #[error("search was cancelled")]
    SearchCancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default sampling rate (frames per second) of the frame sampler.
///
/// Each fingerprint vector therefore covers 100 ms of video.
pub const DEFAULT_TARGET_FPS: f64 = 10.0;

/// Default (width, height) every sampled frame is resized to.
pub const DEFAULT_TARGET_SIZE: (u32, u32) = (320, 240);

/// Default match acceptance cutoff.
///
/// A search only reports a match whose score is strictly below this value. Scores are
/// the mean squared difference between query and window, so 0 is an exact match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.4;

/// Score below which a window is treated as an exact match.
///
/// Seeing such a score stops the scan of the current video, and after that video, the
/// scan of the whole catalogue.
pub const NEAR_PERFECT_SCORE: f64 = 0.01;
