use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

/// Number of leading bytes of a file used for header sniffing and checksums.
const HEADER_LEN: u64 = 8192;

/// Formats the given [Duration] as "MM:SSs"
pub fn format_time(t: Duration) -> String {
    let minutes = t.as_secs() / 60;
    let seconds = t.as_secs() % 60;
    format!("{:02}:{:02}s", minutes, seconds)
}

/// Formats a duration given in seconds with [format_time]. Values that are not a valid
/// [Duration] (negative, NaN or too large) are printed as plain seconds.
pub fn format_seconds(secs: f64) -> String {
    Duration::try_from_secs_f64(secs)
        .map(format_time)
        .unwrap_or_else(|_| format!("{}s", secs))
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    std::fs::File::open(path)?
        .take(HEADER_LEN)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Checks if the given path points to a valid video file.
///
/// If `full` is set to **false**, only the file header will be checked. This is a very cheap
/// operation, but it does not guarantee validity. If set to **true**, FFmpeg will be used to
/// check that the file holds at least one video stream.
pub fn is_valid_video_file(path: impl AsRef<Path>, full: bool) -> bool {
    let path = path.as_ref();
    if !full {
        return match read_header(path) {
            Ok(buf) => infer::is_video(&buf),
            Err(_) => false,
        };
    }

    match ffmpeg_next::format::input(&path) {
        Ok(input) => input
            .streams()
            .any(|s| s.parameters().medium() == ffmpeg_next::util::media::Type::Video),
        Err(_) => false,
    }
}

/// Expands `paths` into a sorted list of video files.
///
/// Files are taken as given. Directories are walked recursively and only the entries that
/// pass [is_valid_video_file] are kept.
pub fn find_video_files(paths: &[impl AsRef<Path>], full: bool) -> Vec<PathBuf> {
    let mut videos = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.is_dir() {
            videos.push(path.to_owned());
            continue;
        }

        let mut found: Vec<PathBuf> = WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.into_path()),
                Err(e) => {
                    tracing::warn!("skipping unreadable entry under {}: {}", path.display(), e);
                    None
                }
            })
            .filter(|p| p.is_file() && is_valid_video_file(p, full))
            .collect();
        found.sort();
        tracing::debug!("found {} videos under {}", found.len(), path.display());
        videos.extend(found);
    }
    videos
}

/// MD5 of the first 8 KiB of the file (or of the whole file, if it is smaller).
pub fn compute_header_md5sum(video: impl AsRef<Path>) -> crate::Result<String> {
    let buf = read_header(video.as_ref())?;
    let hash = format!("{:x}", md5::compute(&buf));
    Ok(hash)
}

/// Returns the underlying FFmpeg version integer.
pub fn ffmpeg_version() -> u32 {
    ffmpeg_next::util::version()
}

/// Returns the underlying FFmpeg version string.
pub fn ffmpeg_version_string() -> String {
    let version_int = ffmpeg_version();

    // Reference: https://github.com/FFmpeg/FFmpeg/blob/130d19bf2044ac76372d1b97ab87ab283c8b37f8/libavutil/version.h#L64
    format!(
        "{}.{}.{}",
        version_int >> 16,              // MAJOR
        (version_int & 0x00FF00) >> 8,  // MINOR
        version_int & 0xFF              // MICRO
    )
}
