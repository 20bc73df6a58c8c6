use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::video::{Fingerprint, FINGERPRINT_LEN};
use crate::{Error, Result};

const MAGIC: [u8; 4] = *b"VFPS";
const FORMAT_VERSION: u32 = 1;

/// Size of the encoded [Header], in bytes. Rows start right after it.
pub(crate) const HEADER_LEN: usize = 32;

const ROW_LEN: usize = FINGERPRINT_LEN * std::mem::size_of::<f64>();

/// Fixed-size header at the start of every sequence file.
///
/// Encoded with bincode's default fixed-width little endian layout, which makes it
/// exactly [HEADER_LEN] bytes long.
#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct Header {
    magic: [u8; 4],
    version: u32,
    width: u32,
    // Size frames were resized to before extraction. (0, 0) if unknown.
    frame_width: u16,
    frame_height: u16,
    frame_count: u64,
    sample_rate: f64,
}

/// Random access to a sequence of fingerprints.
pub trait FingerprintRows {
    fn len(&self) -> usize;

    /// Returns the fingerprint at `idx`. Panics if `idx >= len()`.
    fn row(&self, idx: usize) -> Fingerprint;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FingerprintRows for [Fingerprint] {
    fn len(&self) -> usize {
        <[Fingerprint]>::len(self)
    }

    fn row(&self, idx: usize) -> Fingerprint {
        self[idx]
    }
}

impl FingerprintRows for Vec<Fingerprint> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn row(&self, idx: usize) -> Fingerprint {
        self[idx]
    }
}

/// Writes `fingerprints` to `path`.
///
/// The data goes to a temporary sibling first and is renamed into place once it has been
/// synced, so `path` either does not exist or holds a complete sequence.
pub(crate) fn write_sequence(
    path: impl AsRef<Path>,
    fingerprints: &[Fingerprint],
    sample_rate: f64,
    frame_size: (u32, u32),
) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = super::temp_path(path);

    let (frame_width, frame_height) = match (
        u16::try_from(frame_size.0),
        u16::try_from(frame_size.1),
    ) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(Error::InvalidConfig(format!(
                "frame size {}x{} does not fit in a sequence header",
                frame_size.0, frame_size.1
            )))
        }
    };

    let header = Header {
        magic: MAGIC,
        version: FORMAT_VERSION,
        width: FINGERPRINT_LEN as u32,
        frame_width,
        frame_height,
        frame_count: fingerprints.len() as u64,
        sample_rate,
    };

    let write = || -> Result<()> {
        let f = File::create(&tmp_path)?;
        let mut w = BufWriter::new(f);
        bincode::serialize_into(&mut w, &header)?;
        for v in fingerprints.iter().flatten() {
            w.write_f64::<LittleEndian>(*v)?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    };

    if let Err(e) = write().and_then(|_| Ok(std::fs::rename(&tmp_path, path)?)) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(())
}

/// A memory-mapped fingerprint sequence file.
///
/// Rows are decoded on access; opening a view does not read the sequence into memory.
pub struct SequenceView {
    path: PathBuf,
    mmap: Mmap,
    frame_count: usize,
    sample_rate: f64,
    frame_size: Option<(u32, u32)>,
}

impl std::fmt::Debug for SequenceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceView")
            .field("path", &self.path)
            .field("frame_count", &self.frame_count)
            .field("sample_rate", &self.sample_rate)
            .field("frame_size", &self.frame_size)
            .finish()
    }
}

impl SequenceView {
    /// Maps the sequence file at `path` and validates its header.
    ///
    /// I/O failures are returned as [Error::IOError]; a file that is not a complete
    /// sequence yields [Error::InvalidSequenceFile].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |reason: String| Error::InvalidSequenceFile {
            path: path.to_owned(),
            reason,
        };

        let f = File::open(path)?;
        let file_len = f.metadata()?.len() as usize;
        if file_len < HEADER_LEN {
            return Err(invalid(format!("file is only {} bytes long", file_len)));
        }

        // SAFETY: Sequence files are written once and renamed into place; they are never
        // modified afterwards, only unlinked, which leaves existing mappings intact.
        let mmap = unsafe { Mmap::map(&f)? };

        let header: Header = bincode::deserialize(&mmap[..HEADER_LEN])?;
        if header.magic != MAGIC {
            return Err(invalid("bad magic".to_string()));
        }
        if header.version != FORMAT_VERSION {
            return Err(invalid(format!("unsupported version {}", header.version)));
        }
        if header.width as usize != FINGERPRINT_LEN {
            return Err(invalid(format!("unexpected vector width {}", header.width)));
        }
        if !header.sample_rate.is_finite() || header.sample_rate <= 0.0 {
            return Err(invalid(format!("bad sample rate {}", header.sample_rate)));
        }

        let frame_count = header.frame_count as usize;
        let expected_len = frame_count
            .checked_mul(ROW_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected_len != Some(file_len) {
            return Err(invalid(format!(
                "expected {} rows, but file is {} bytes long",
                frame_count, file_len
            )));
        }

        let frame_size = match (header.frame_width, header.frame_height) {
            (0, 0) => None,
            (w, h) => Some((w as u32, h as u32)),
        };

        Ok(Self {
            path: path.to_owned(),
            mmap,
            frame_count,
            sample_rate: header.sample_rate,
            frame_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of fingerprints in the sequence.
    pub fn len(&self) -> usize {
        self.frame_count
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    /// Rate (fingerprints per second) the video was sampled at.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Size (width, height) frames were resized to before extraction, if recorded.
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    /// Returns the fingerprint at `idx`, if it exists.
    pub fn get(&self, idx: usize) -> Option<Fingerprint> {
        if idx < self.frame_count {
            Some(self.row(idx))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        (0..self.frame_count).map(move |i| self.row(i))
    }

    /// Copies the whole sequence into memory.
    pub fn to_vec(&self) -> Vec<Fingerprint> {
        self.iter().collect()
    }
}

impl FingerprintRows for SequenceView {
    fn len(&self) -> usize {
        self.frame_count
    }

    #[inline]
    fn row(&self, idx: usize) -> Fingerprint {
        assert!(idx < self.frame_count, "row {} out of bounds", idx);
        let start = HEADER_LEN + idx * ROW_LEN;
        let mut row = [0.0; FINGERPRINT_LEN];
        LittleEndian::read_f64_into(&self.mmap[start..start + ROW_LEN], &mut row);
        row
    }
}
