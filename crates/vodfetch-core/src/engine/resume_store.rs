//! Durable resume records, one JSON file per destination
//!
//! A record is replaced atomically: the new content goes to a temporary
//! sibling, is synced, and is then renamed over the old file. A crash at
//! any point leaves either the previous record or the new one.

use crate::error::EngineError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use vodfetch_types::ResumeRecord;

const RECORD_SUFFIX: &str = ".resume.json";

/// Resume records stored in a directory
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// Open the store, creating its directory
    pub async fn new(dir: PathBuf) -> Result<Self, EngineError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the record for `destination`
    pub fn record_path(&self, destination: &Path) -> PathBuf {
        let digest = Sha256::digest(destination.to_string_lossy().as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}{}", name, RECORD_SUFFIX))
    }

    /// Load the record for `destination`; unreadable records count as absent
    pub async fn load(&self, destination: &Path) -> Result<Option<ResumeRecord>, EngineError> {
        let path = self.record_path(destination);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let Some(record) = read_record(&path).await else {
            return Ok(None);
        };
        if record.destination != destination {
            warn!(
                "Resume record {:?} belongs to {:?}, ignoring",
                path, record.destination
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Atomically replace the record for `record.destination`
    pub async fn save(&self, record: &ResumeRecord) -> Result<(), EngineError> {
        let path = self.record_path(&record.destination);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        debug!(
            "Saved resume record for {:?} ({} bytes done)",
            record.destination,
            record.completed_bytes()
        );
        Ok(())
    }

    /// Remove the record for `destination`, if any
    pub async fn delete(&self, destination: &Path) -> Result<(), EngineError> {
        let path = self.record_path(destination);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted resume record for {:?}", destination);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records, oldest first
    pub async fn list(&self) -> Result<Vec<ResumeRecord>, EngineError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(RECORD_SUFFIX))
                .unwrap_or(false);
            if !is_record {
                continue;
            }
            if let Some(record) = read_record(&path).await {
                records.push(record);
            }
        }

        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }
}

async fn read_record(path: &Path) -> Option<ResumeRecord> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read resume record {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_slice(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping corrupt resume record {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vodfetch_types::{ChunkRecord, ContentValidator};

    fn record(destination: &Path) -> ResumeRecord {
        ResumeRecord {
            destination: destination.to_path_buf(),
            source_url: "http://portal.example.com/movie/1.mkv".into(),
            total_size: Some(300),
            supports_range: true,
            validator: ContentValidator {
                etag: Some("\"abc\"".into()),
                last_modified: None,
                size: Some(300),
            },
            chunks: vec![
                ChunkRecord { start: 0, end: 99, received: 100 },
                ChunkRecord { start: 100, end: 199, received: 40 },
                ChunkRecord { start: 200, end: 299, received: 0 },
            ],
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("state")).await.unwrap();
        let dest = dir.path().join("movies/Film.mkv");

        assert!(store.load(&dest).await.unwrap().is_none());

        store.save(&record(&dest)).await.unwrap();
        let loaded = store.load(&dest).await.unwrap().unwrap();
        assert_eq!(loaded.completed_bytes(), 140);
        assert_eq!(loaded.chunks.len(), 3);

        store.delete(&dest).await.unwrap();
        assert!(store.load(&dest).await.unwrap().is_none());
        // Deleting twice is fine
        store.delete(&dest).await.unwrap();
    }

    #[tokio::test]
    async fn save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf()).await.unwrap();
        let dest = dir.path().join("a.mkv");

        store.save(&record(&dest)).await.unwrap();
        store.save(&record(&dest)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(RECORD_SUFFIX));
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf()).await.unwrap();
        let good = dir.path().join("good.mkv");
        let bad = dir.path().join("bad.mkv");

        store.save(&record(&good)).await.unwrap();
        fs::write(store.record_path(&bad), b"{ not json").await.unwrap();

        assert!(store.load(&bad).await.unwrap().is_none());
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].destination, good);
    }

    #[test]
    fn record_names_are_stable_and_distinct() {
        let store = ResumeStore { dir: PathBuf::from("/state") };
        let a = store.record_path(Path::new("/out/a.mkv"));
        assert_eq!(a, store.record_path(Path::new("/out/a.mkv")));
        assert_ne!(a, store.record_path(Path::new("/out/b.mkv")));
        assert!(a.to_string_lossy().ends_with(".resume.json"));
    }
}
