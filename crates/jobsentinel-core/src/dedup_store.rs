use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::dedup::DedupEntry;
use crate::error::AppError;
use crate::traits::DedupStore;

/// Append-only JSON-lines dedup store for single-machine deployments.
///
/// One [`DedupEntry`] per line. Lines that fail to parse are skipped and
/// logged, so a torn trailing write never costs the rest of the history.
#[derive(Clone)]
pub struct FileDedupStore {
    path: PathBuf,
    known: Arc<Mutex<Option<HashSet<String>>>>,
}

impl FileDedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            known: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every well-formed entry in the file.
    ///
    /// A malformed line (usually a write torn by a crash) is logged as
    /// index corruption and skipped; the rest of the history still loads.
    async fn read_all(&self) -> Result<Vec<DedupEntry>, AppError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DedupEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let err = AppError::DedupIndexCorruption(format!(
                        "{}:{}: {e}",
                        self.path.display(),
                        n + 1
                    ));
                    tracing::error!(error = %err, "Skipping malformed dedup entry");
                }
            }
        }
        Ok(entries)
    }

    /// Open for appending, reporting whether the file ends mid-line.
    async fn open_for_append(&self) -> Result<(tokio::fs::File, bool), AppError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut torn = false;
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            torn = last[0] != b'\n';
        }
        Ok((file, torn))
    }
}

impl DedupStore for FileDedupStore {
    async fn load_recent(&self, limit: usize) -> Result<Vec<DedupEntry>, AppError> {
        let mut entries = self.read_all().await?;

        let mut known = self.known.lock().await;
        *known = Some(entries.iter().map(|e| e.identity_key.clone()).collect());
        drop(known);

        entries.sort_by(|a, b| b.first_seen_at.cmp(&a.first_seen_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn record(&self, entries: &[DedupEntry]) -> Result<(), AppError> {
        let mut known = self.known.lock().await;
        if known.is_none() {
            let existing = self.read_all().await?;
            *known = Some(existing.into_iter().map(|e| e.identity_key).collect());
        }
        let Some(known) = known.as_mut() else {
            return Ok(());
        };

        let mut buf = String::new();
        for entry in entries {
            if known.insert(entry.identity_key.clone()) {
                buf.push_str(&serde_json::to_string(entry)?);
                buf.push('\n');
            }
        }
        if buf.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (mut file, torn) = self.open_for_append().await?;
        if torn {
            // Terminate the partial line so the new entries parse.
            buf.insert(0, '\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(path = %self.path.display(), "Dedup entries persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::dedup::KeyTier;

    fn entry(key: &str, age_minutes: i64) -> DedupEntry {
        DedupEntry {
            identity_key: key.to_string(),
            key_tier: KeyTier::ExternalId,
            source_id: "greenhouse".into(),
            external_id: Some(key.to_string()),
            first_seen_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDedupStore::new(dir.path().join("seen.jsonl"));
        assert!(store.load_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("seen.jsonl");

        let store = FileDedupStore::new(&path);
        store
            .record(&[entry("ext:a:1", 30), entry("ext:a:2", 10)])
            .await
            .unwrap();

        let reopened = FileDedupStore::new(&path);
        let loaded = reopened.load_recent(10).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].identity_key, "ext:a:2");
    }

    #[tokio::test]
    async fn duplicate_keys_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDedupStore::new(dir.path().join("seen.jsonl"));

        store.record(&[entry("ext:a:1", 5)]).await.unwrap();
        store.record(&[entry("ext:a:1", 1)]).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn load_respects_limit_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDedupStore::new(dir.path().join("seen.jsonl"));
        let entries: Vec<_> = (0..5).map(|i| entry(&format!("k{i}"), i)).collect();
        store.record(&entries).await.unwrap();

        let loaded = store.load_recent(2).await.unwrap();
        let keys: Vec<_> = loaded.iter().map(|e| e.identity_key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1"]);
    }

    #[tokio::test]
    async fn torn_line_is_skipped_and_store_keeps_working() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        let valid = serde_json::to_string(&entry("ext:a:1", 10)).unwrap();
        std::fs::write(&path, format!("{valid}\n{{\"identity_key\": \"ext:a:")).unwrap();

        let store = FileDedupStore::new(&path);
        let loaded = store.load_recent(10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity_key, "ext:a:1");

        store.record(&[entry("ext:a:2", 1)]).await.unwrap();

        let reopened = FileDedupStore::new(&path).load_recent(10).await.unwrap();
        let keys: Vec<_> = reopened.iter().map(|e| e.identity_key.as_str()).collect();
        assert_eq!(keys, vec!["ext:a:2", "ext:a:1"]);
    }

    #[tokio::test]
    async fn record_appends_after_garbage_without_prior_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let store = FileDedupStore::new(&path);
        store.record(&[entry("ext:a:1", 1)]).await.unwrap();

        let loaded = store.load_recent(10).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
