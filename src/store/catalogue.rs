use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Metadata kept for every ingested video.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CatalogueRecord {
    /// Display name.
    pub name: String,
    /// Path of the source the fingerprints were extracted from.
    pub original_path: String,
    /// Number of fingerprints in the stored sequence.
    #[serde(alias = "frames")]
    pub frame_count: usize,
    pub duration_sec: f64,
    /// MD5 of the first 8 KiB of the source file, when it was read from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_md5: Option<String>,
}

/// The id → record map and the JSON file that backs it.
///
/// The file is rewritten in full on every save.
#[derive(Debug)]
pub(crate) struct Catalogue {
    path: PathBuf,
    pub(crate) records: BTreeMap<String, CatalogueRecord>,
}

impl Catalogue {
    /// Loads the catalogue at `path`. A missing file is an empty catalogue.
    pub(crate) fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let records = match File::open(path) {
            Ok(f) => serde_json::from_reader(std::io::BufReader::new(f)).map_err(|source| {
                Error::CatalogueCorrupt {
                    path: path.to_owned(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no catalogue at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_owned(),
            records,
        })
    }

    /// Replaces the in-memory records with what is currently on disk.
    pub(crate) fn reload(&mut self) -> Result<()> {
        self.records = Self::load(&self.path)?.records;
        Ok(())
    }

    /// Writes the catalogue to disk.
    ///
    /// The JSON goes to a temporary sibling that is synced and then renamed over the old
    /// file, so readers see either the previous or the new catalogue in full.
    pub(crate) fn save(&self) -> Result<()> {
        let tmp_path = super::temp_path(&self.path);

        let write = || -> Result<()> {
            let f = File::create(&tmp_path)?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer_pretty(&mut w, &self.records)?;
            w.flush()?;
            w.get_ref().sync_all()?;
            Ok(())
        };

        if let Err(e) = write().and_then(|_| Ok(std::fs::rename(&tmp_path, &self.path)?)) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(name: &str, frame_count: usize) -> CatalogueRecord {
        CatalogueRecord {
            name: name.to_string(),
            original_path: format!("/videos/{}.mp4", name),
            frame_count,
            duration_sec: frame_count as f64 / 10.0,
            source_md5: None,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue = Catalogue::load(dir.path().join("metadata.json")).unwrap();
        assert!(catalogue.records.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let mut catalogue = Catalogue::load(&path).unwrap();
        catalogue.records.insert("a".to_string(), record("first", 50));
        catalogue.records.insert("b".to_string(), record("second", 12));
        catalogue.save().unwrap();
        assert!(!super::super::temp_path(&path).exists());

        let reloaded = Catalogue::load(&path).unwrap();
        assert_eq!(reloaded.records, catalogue.records);
    }

    #[test]
    fn test_reload_sees_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let mut first = Catalogue::load(&path).unwrap();
        let mut second = Catalogue::load(&path).unwrap();
        first.records.insert("a".to_string(), record("first", 5));
        first.save().unwrap();

        second.reload().unwrap();
        second.records.insert("b".to_string(), record("second", 7));
        second.save().unwrap();

        let on_disk = Catalogue::load(&path).unwrap();
        assert_eq!(
            on_disk.records.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(&path, "{\"a\": {\"name\": ").unwrap();
        let err = Catalogue::load(&path).unwrap_err();
        assert!(matches!(err, Error::CatalogueCorrupt { .. }));
    }

    #[test]
    fn test_legacy_frames_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(
            &path,
            r#"{"4b0a": {"name": "The Matrix", "original_path": "movies/matrix.mp4", "frames": 300, "duration_sec": 30.0}}"#,
        )
        .unwrap();
        let catalogue = Catalogue::load(&path).unwrap();
        let rec = &catalogue.records["4b0a"];
        assert_eq!(rec.frame_count, 300);
        assert_eq!(rec.source_md5, None);
    }

    #[test]
    fn test_serialized_shape() {
        let mut records = BTreeMap::new();
        records.insert("id-1".to_string(), record("clip", 50));
        insta::assert_snapshot!(serde_json::to_string(&records).unwrap(), @r###"{"id-1":{"name":"clip","original_path":"/videos/clip.mp4","frame_count":50,"duration_sec":5.0}}"###);
    }
}
