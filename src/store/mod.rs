//! On-disk fingerprint storage.
//!
//! A store is a directory holding a JSON catalogue and one sequence file per video:
//!
//! ```text
//! <root>/metadata.json
//! <root>/fingerprints/<id>.vfp
//! ```
//!
//! A sequence file is always in place before its catalogue record is written, and a
//! record is always removed before its sequence file. A crash can therefore leave a
//! sequence file without a record (see [FingerprintStore::prune_orphans]), but never a
//! record without a sequence file.
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::search::{MatchResult, Searcher};
use crate::video::{self, Fingerprint, FrameSource, Sampler, VideoFile};
use crate::{Error, Result};

mod catalogue;
mod sequence;

use catalogue::Catalogue;
pub use catalogue::CatalogueRecord;
pub use sequence::{FingerprintRows, SequenceView};

static CATALOGUE_FILE_NAME: &str = "metadata.json";
static FINGERPRINTS_DIR_NAME: &str = "fingerprints";
static SEQUENCE_FILE_EXT: &str = "vfp";
static TEMP_FILE_EXT: &str = "tmp";

// Appends the temporary file extension to the file name of `path`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().unwrap_or_default().to_owned();
    name.push(".");
    name.push(TEMP_FILE_EXT);
    path.with_file_name(name)
}

/// Fingerprint storage for a catalogue of videos.
///
/// All methods take `&self`; the store can be shared between threads (e.g., behind an
/// `Arc`). Catalogue mutations are serialized internally, and searches work on a snapshot
/// of the catalogue taken when they start.
///
/// # Example
///
/// ```
/// use clipseek::FingerprintStore;
///
/// let store = FingerprintStore::open("./data/video_db").unwrap();
/// let id = store.ingest("movies/matrix.mp4", Some("The Matrix")).unwrap();
///
/// let query = store.extract_query("clip.mp4").unwrap();
/// if let Some(m) = store.search(&query, clipseek::DEFAULT_MATCH_THRESHOLD).unwrap() {
///     println!("{}", m);
/// }
/// # store.remove(&id).unwrap();
/// ```
#[derive(Debug)]
pub struct FingerprintStore {
    root: PathBuf,
    fingerprints_dir: PathBuf,
    sampler: Sampler,
    catalogue: RwLock<Catalogue>,
}

impl FingerprintStore {
    /// Opens (or creates) the store rooted at `root`.
    ///
    /// A missing catalogue file means an empty store. A catalogue that cannot be parsed
    /// is reported as [Error::CatalogueCorrupt] and left untouched.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_owned();
        let fingerprints_dir = root.join(FINGERPRINTS_DIR_NAME);
        std::fs::create_dir_all(&fingerprints_dir)?;

        let catalogue = Catalogue::load(root.join(CATALOGUE_FILE_NAME))?;
        tracing::info!(
            videos = catalogue.records.len(),
            "opened fingerprint store at {}",
            root.display()
        );

        Ok(Self {
            root,
            fingerprints_dir,
            sampler: Sampler::default(),
            catalogue: RwLock::new(catalogue),
        })
    }

    /// Returns a new [FingerprintStore] that samples videos with the provided `sampler`.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    fn read_catalogue(&self) -> RwLockReadGuard<'_, Catalogue> {
        self.catalogue.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_catalogue(&self) -> RwLockWriteGuard<'_, Catalogue> {
        self.catalogue.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sequence_path(&self, id: &str) -> PathBuf {
        self.fingerprints_dir
            .join(id)
            .with_extension(SEQUENCE_FILE_EXT)
    }

    /// Fingerprints the video at `path` and adds it to the catalogue.
    ///
    /// If `display_name` is not given, the file name is used. Returns the id of the new
    /// record. Nothing is added if the video cannot be decoded or yields no frames.
    pub fn ingest(&self, path: impl AsRef<Path>, display_name: Option<&str>) -> Result<String> {
        let path = path.as_ref();
        let name = match display_name {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };

        let md5 = crate::util::compute_header_md5sum(path).ok();
        let video = VideoFile::open(path, self.sampler.threaded_decoding())?;
        self.ingest_inner(video, &name, md5)
    }

    /// Fingerprints frames from any [FrameSource] and adds them to the catalogue.
    pub fn ingest_source<S: FrameSource>(&self, source: S, display_name: &str) -> Result<String> {
        self.ingest_inner(source, display_name, None)
    }

    fn ingest_inner<S: FrameSource>(
        &self,
        source: S,
        name: &str,
        md5: Option<String>,
    ) -> Result<String> {
        let span = tracing::span!(tracing::Level::TRACE, "ingest");
        let _enter = span.enter();

        let original_path = source.path().display().to_string();
        tracing::info!("processing {} ({})", name, original_path);

        let fingerprints = self.fingerprint_source(source)?;
        self.commit(
            name,
            &original_path,
            md5,
            &fingerprints,
            self.sampler.target_fps(),
            self.sampler.target_size(),
        )
    }

    /// Samples and fingerprints `source` with this store's sampler.
    ///
    /// Fails with [Error::EmptyExtraction] if no frame could be sampled.
    pub fn fingerprint_source<S: FrameSource>(&self, source: S) -> Result<Vec<Fingerprint>> {
        let path = source.path().to_owned();
        let frames = self.sampler.sample(source)?;
        if frames.is_empty() {
            return Err(Error::EmptyExtraction(path));
        }
        Ok(video::extract(&frames))
    }

    /// Fingerprints a query clip with the same sampling settings as the catalogue.
    pub fn extract_query(&self, path: impl AsRef<Path>) -> Result<Vec<Fingerprint>> {
        let video = VideoFile::open(path, self.sampler.threaded_decoding())?;
        self.fingerprint_source(video)
    }

    // Writes the sequence file, then the catalogue record. If the catalogue cannot be
    // saved, the record and the file are both dropped again.
    pub(crate) fn commit(
        &self,
        name: &str,
        original_path: &str,
        source_md5: Option<String>,
        fingerprints: &[Fingerprint],
        sample_rate: f64,
        frame_size: (u32, u32),
    ) -> Result<String> {
        if fingerprints.is_empty() {
            return Err(Error::EmptyExtraction(PathBuf::from(original_path)));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let seq_path = self.sequence_path(&id);
        let record = CatalogueRecord {
            name: name.to_owned(),
            original_path: original_path.to_owned(),
            frame_count: fingerprints.len(),
            duration_sec: fingerprints.len() as f64 / sample_rate,
            source_md5,
        };

        // Held across the file write so that a concurrent prune cannot mistake the new
        // file for an orphan.
        let mut catalogue = self.write_catalogue();

        sequence::write_sequence(&seq_path, fingerprints, sample_rate, frame_size)?;

        // Pick up records saved by other processes since this store was opened.
        if let Err(e) = catalogue.reload() {
            let _ = std::fs::remove_file(&seq_path);
            return Err(e);
        }
        catalogue.records.insert(id.clone(), record);
        if let Err(e) = catalogue.save() {
            catalogue.records.remove(&id);
            let _ = std::fs::remove_file(&seq_path);
            return Err(e);
        }

        tracing::info!(
            frames = fingerprints.len(),
            "saved fingerprints for {} to {}",
            name,
            seq_path.display()
        );

        Ok(id)
    }

    /// Returns a snapshot of the catalogue.
    pub fn get_catalogue(&self) -> BTreeMap<String, CatalogueRecord> {
        self.read_catalogue().records.clone()
    }

    /// Returns the record for `id`, if any.
    pub fn get(&self, id: &str) -> Option<CatalogueRecord> {
        self.read_catalogue().records.get(id).cloned()
    }

    /// Number of videos in the catalogue.
    pub fn len(&self) -> usize {
        self.read_catalogue().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds a record whose source had the given header checksum.
    pub fn find_by_md5(&self, md5: &str) -> Option<(String, CatalogueRecord)> {
        self.read_catalogue()
            .records
            .iter()
            .find(|(_, r)| r.source_md5.as_deref() == Some(md5))
            .map(|(id, r)| (id.clone(), r.clone()))
    }

    /// Opens the stored fingerprint sequence of `id` without reading it into memory.
    pub fn load_sequence(&self, id: &str) -> Result<SequenceView> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::UnknownVideo(id.to_owned()))?;
        self.open_sequence(id, &record)
    }

    pub(crate) fn open_sequence(&self, id: &str, record: &CatalogueRecord) -> Result<SequenceView> {
        let path = self.sequence_path(id);
        let view = SequenceView::open(&path).map_err(|e| match e {
            Error::IOError(source) => Error::MissingSequenceFile {
                id: id.to_owned(),
                path: path.clone(),
                source,
            },
            e => e,
        })?;

        if view.len() != record.frame_count {
            return Err(Error::InvalidSequenceFile {
                path,
                reason: format!(
                    "catalogue expects {} frames, file holds {}",
                    record.frame_count,
                    view.len()
                ),
            });
        }

        Ok(view)
    }

    /// Removes `id` from the catalogue and deletes its sequence file.
    ///
    /// The record goes first. If the file cannot be deleted afterwards it is left behind
    /// as an orphan, which [FingerprintStore::prune_orphans] cleans up.
    pub fn remove(&self, id: &str) -> Result<CatalogueRecord> {
        let record = {
            let mut catalogue = self.write_catalogue();
            catalogue.reload()?;
            let record = catalogue
                .records
                .remove(id)
                .ok_or_else(|| Error::UnknownVideo(id.to_owned()))?;
            if let Err(e) = catalogue.save() {
                catalogue.records.insert(id.to_owned(), record);
                return Err(e);
            }
            record
        };

        let seq_path = self.sequence_path(id);
        match std::fs::remove_file(&seq_path) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => tracing::warn!(
                "removed {} from catalogue, but could not delete {}: {}",
                id,
                seq_path.display(),
                e
            ),
        }

        tracing::info!("removed {} ({})", record.name, id);
        Ok(record)
    }

    /// Deletes sequence files that have no catalogue record, along with leftover
    /// temporary files. Returns the number of files deleted.
    ///
    /// Must not run while another process is ingesting into the same store: its sequence
    /// file exists briefly before its record does.
    pub fn prune_orphans(&self) -> Result<usize> {
        let mut catalogue = self.write_catalogue();
        catalogue.reload()?;
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.fingerprints_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str());
            let orphan = match ext {
                Some(ext) if ext == TEMP_FILE_EXT => true,
                Some(ext) if ext == SEQUENCE_FILE_EXT => path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map_or(true, |id| !catalogue.records.contains_key(id)),
                _ => false,
            };
            if orphan {
                std::fs::remove_file(&path)?;
                tracing::info!("deleted orphaned file {}", path.display());
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Searches the catalogue for the window that best matches `query`, accepting it only
    /// if its score is strictly below `threshold`.
    ///
    /// `query` is expected to come from this store's sampler (see
    /// [FingerprintStore::extract_query]); sequences sampled differently are skipped.
    pub fn search(&self, query: &[Fingerprint], threshold: f64) -> Result<Option<MatchResult>> {
        Searcher::default()
            .with_threshold(threshold)
            .with_sampler(&self.sampler)
            .search(self, query)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::video::testing::SyntheticVideo;

    fn open_store() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_ingest_static_clip() {
        let (_dir, store) = open_store();
        let video = SyntheticVideo::static_gray("clip_a.mp4", 10.0, 5.0, 128);
        let id = store.ingest_source(video, "Clip A").unwrap();

        let catalogue = store.get_catalogue();
        let record = &catalogue[&id];
        assert_eq!(record.name, "Clip A");
        assert_eq!(record.original_path, "clip_a.mp4");
        assert_eq!(record.frame_count, 50);
        assert_eq!(record.duration_sec, 5.0);

        let seq = store.load_sequence(&id).unwrap();
        assert_eq!(seq.len(), 50);
        assert_eq!(seq.sample_rate(), 10.0);
        assert!(seq.iter().all(|fp| fp == [0.0; 8]));
    }

    #[test]
    fn test_catalogue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FingerprintStore::open(dir.path()).unwrap();
            store
                .ingest_source(SyntheticVideo::textured("t.mp4", 10.0, 12, 0.0), "T")
                .unwrap()
        };

        let store = FingerprintStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id).unwrap().frame_count, 12);
        assert_eq!(store.load_sequence(&id).unwrap().len(), 12);
    }

    #[test]
    fn test_empty_extraction_leaves_catalogue_untouched() {
        let (dir, store) = open_store();
        let err = store
            .ingest_source(SyntheticVideo::new("empty.mp4", 10.0, Vec::new()), "Empty")
            .unwrap_err();
        assert!(matches!(err, Error::EmptyExtraction(_)));
        assert!(store.is_empty());
        assert!(!dir.path().join(CATALOGUE_FILE_NAME).exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join(FINGERPRINTS_DIR_NAME))
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn test_unreadable_source_leaves_catalogue_untouched() {
        let (_dir, store) = open_store();
        let video = SyntheticVideo::static_gray("bad.mp4", 10.0, 1.0, 0).failing_at(0);
        let err = store.ingest_source(video, "Bad").unwrap_err();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_ingest_missing_file() {
        let (_dir, store) = open_store();
        let err = store.ingest("/nonexistent/video.mp4", None).unwrap_err();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_reingest_creates_new_record() {
        let (_dir, store) = open_store();
        let a = store
            .ingest_source(SyntheticVideo::static_gray("same.mp4", 10.0, 1.0, 3), "Same")
            .unwrap();
        let b = store
            .ingest_source(SyntheticVideo::static_gray("same.mp4", 10.0, 1.0, 3), "Same")
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = open_store();
        let keep = store
            .ingest_source(SyntheticVideo::static_gray("keep.mp4", 10.0, 1.0, 1), "Keep")
            .unwrap();
        let gone = store
            .ingest_source(SyntheticVideo::static_gray("gone.mp4", 10.0, 1.0, 2), "Gone")
            .unwrap();

        let record = store.remove(&gone).unwrap();
        assert_eq!(record.name, "Gone");
        assert!(!store.get_catalogue().contains_key(&gone));
        assert!(!store.sequence_path(&gone).exists());
        assert!(matches!(
            store.load_sequence(&gone).unwrap_err(),
            Error::UnknownVideo(_)
        ));
        assert!(matches!(store.remove(&gone).unwrap_err(), Error::UnknownVideo(_)));

        // The removal is persisted.
        let reopened = FingerprintStore::open(store.root()).unwrap();
        assert_eq!(
            reopened.get_catalogue().keys().collect::<Vec<_>>(),
            vec![&keep]
        );
    }

    #[test]
    fn test_missing_sequence_file() {
        let (_dir, store) = open_store();
        let id = store
            .ingest_source(SyntheticVideo::static_gray("x.mp4", 10.0, 1.0, 1), "X")
            .unwrap();
        std::fs::remove_file(store.sequence_path(&id)).unwrap();
        assert!(matches!(
            store.load_sequence(&id).unwrap_err(),
            Error::MissingSequenceFile { .. }
        ));
    }

    #[test]
    fn test_frame_count_mismatch() {
        let (_dir, store) = open_store();
        let id = store
            .ingest_source(SyntheticVideo::static_gray("x.mp4", 10.0, 1.0, 1), "X")
            .unwrap();
        sequence::write_sequence(store.sequence_path(&id), &[[0.0; 8]; 3], 10.0, (320, 240)).unwrap();
        assert!(matches!(
            store.load_sequence(&id).unwrap_err(),
            Error::InvalidSequenceFile { .. }
        ));
    }

    #[test]
    fn test_corrupt_catalogue_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CATALOGUE_FILE_NAME), "not json").unwrap();
        let err = FingerprintStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CatalogueCorrupt { .. }));
        // The corrupt file is not reset.
        assert_eq!(
            std::fs::read_to_string(dir.path().join(CATALOGUE_FILE_NAME)).unwrap(),
            "not json"
        );
    }

    #[test]
    fn test_prune_orphans() {
        let (_dir, store) = open_store();
        let id = store
            .ingest_source(SyntheticVideo::static_gray("x.mp4", 10.0, 1.0, 1), "X")
            .unwrap();
        let orphan = store.sequence_path("orphan");
        sequence::write_sequence(&orphan, &[[0.0; 8]], 10.0, (320, 240)).unwrap();
        let stale = temp_path(&store.sequence_path("half-written"));
        std::fs::write(&stale, b"partial").unwrap();

        assert_eq!(store.prune_orphans().unwrap(), 2);
        assert!(!orphan.exists());
        assert!(!stale.exists());
        assert!(store.load_sequence(&id).is_ok());
        assert_eq!(store.prune_orphans().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_handles_keep_each_others_records() {
        let dir = tempfile::tempdir().unwrap();
        let first = FingerprintStore::open(dir.path()).unwrap();
        let second = FingerprintStore::open(dir.path()).unwrap();

        let a = first
            .ingest_source(SyntheticVideo::static_gray("a.mp4", 10.0, 1.0, 1), "A")
            .unwrap();
        let b = second
            .ingest_source(SyntheticVideo::static_gray("b.mp4", 10.0, 1.0, 2), "B")
            .unwrap();

        // Neither file looks orphaned to a handle opened before both ingests.
        assert_eq!(first.prune_orphans().unwrap(), 0);

        let reopened = FingerprintStore::open(dir.path()).unwrap();
        let catalogue = reopened.get_catalogue();
        assert!(catalogue.contains_key(&a));
        assert!(catalogue.contains_key(&b));
        assert!(reopened.load_sequence(&a).is_ok());
        assert!(reopened.load_sequence(&b).is_ok());

        // Removing through the stale handle keeps the other record.
        first.remove(&a).unwrap();
        let reopened = FingerprintStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_catalogue().keys().collect::<Vec<_>>(), vec![&b]);
    }

    #[test]
    fn test_find_by_md5() {
        let (_dir, store) = open_store();
        let id = store
            .commit("M", "m.mp4", Some("abc".to_string()), &[[0.0; 8]; 2], 10.0, (320, 240))
            .unwrap();
        assert_eq!(store.find_by_md5("abc").map(|(i, _)| i), Some(id));
        assert!(store.find_by_md5("def").is_none());
    }

    #[test]
    fn test_custom_sampler() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(dir.path())
            .unwrap()
            .with_sampler(Sampler::default().with_target_fps(5.0));
        let id = store
            .ingest_source(SyntheticVideo::static_gray("x.mp4", 10.0, 2.0, 1), "X")
            .unwrap();
        let record = store.get(&id).unwrap();
        assert_eq!(record.frame_count, 10);
        assert_eq!(record.duration_sec, 2.0);
        assert_eq!(store.load_sequence(&id).unwrap().sample_rate(), 5.0);
    }
}
