//! Per-account sync cursors.
//!
//! A cursor is only ever moved forward. Callers advance it after the ledger
//! acknowledged every batch of the account, so a failed commit leaves the
//! previous position in place and the next run re-fetches the same window.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::SyncCursor;

/// Storage for sync cursors keyed by instance and account.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, instance_id: &str, account_id: &str) -> Result<Option<SyncCursor>>;

    /// All cursors of an instance, by account.
    async fn all(&self, instance_id: &str) -> Result<BTreeMap<String, SyncCursor>>;

    /// Move the cursor to `candidate` if it is ahead of the stored one.
    /// Returns the stored cursor afterwards.
    async fn advance(&self, instance_id: &str, account_id: &str, candidate: SyncCursor) -> Result<SyncCursor>;

    /// Forget every cursor of an instance.
    async fn clear(&self, instance_id: &str) -> Result<()>;
}

/// Cursors held in memory.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<(String, String), SyncCursor>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, instance_id: &str, account_id: &str) -> Result<Option<SyncCursor>> {
        Ok(self
            .cursors
            .get(&(instance_id.to_string(), account_id.to_string()))
            .map(|c| c.value().clone()))
    }

    async fn all(&self, instance_id: &str) -> Result<BTreeMap<String, SyncCursor>> {
        Ok(self
            .cursors
            .iter()
            .filter(|entry| entry.key().0 == instance_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect())
    }

    async fn advance(&self, instance_id: &str, account_id: &str, candidate: SyncCursor) -> Result<SyncCursor> {
        let mut entry = self
            .cursors
            .entry((instance_id.to_string(), account_id.to_string()))
            .or_insert_with(|| candidate.clone());
        if candidate > *entry {
            *entry = candidate;
        }
        Ok(entry.clone())
    }

    async fn clear(&self, instance_id: &str) -> Result<()> {
        self.cursors.retain(|key, _| key.0 != instance_id);
        Ok(())
    }
}

type CursorFile = BTreeMap<String, BTreeMap<String, SyncCursor>>;

/// Cursors persisted as one JSON document.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// leaves either the old or the new document.
pub struct FileCursorStore {
    path: PathBuf,
    state: Mutex<CursorFile>,
}

impl FileCursorStore {
    /// Open the store, loading existing cursors if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Unknown(format!("Corrupt cursor file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CursorFile::new(),
            Err(e) => {
                return Err(SyncError::Unknown(format!(
                    "Cannot read cursor file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &CursorFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::Unknown(format!("Cannot encode cursors: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), "Cursors persisted");
        Ok(())
    }

    fn io_error(&self, e: std::io::Error) -> SyncError {
        SyncError::Unknown(format!("Cannot write cursor file {}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn get(&self, instance_id: &str, account_id: &str) -> Result<Option<SyncCursor>> {
        let state = self.state.lock().await;
        Ok(state.get(instance_id).and_then(|a| a.get(account_id)).cloned())
    }

    async fn all(&self, instance_id: &str) -> Result<BTreeMap<String, SyncCursor>> {
        let state = self.state.lock().await;
        Ok(state.get(instance_id).cloned().unwrap_or_default())
    }

    async fn advance(&self, instance_id: &str, account_id: &str, candidate: SyncCursor) -> Result<SyncCursor> {
        let mut state = self.state.lock().await;
        let current = state.get(instance_id).and_then(|a| a.get(account_id)).cloned();
        match current {
            Some(current) if current >= candidate => Ok(current),
            _ => {
                let mut next = state.clone();
                next.entry(instance_id.to_string())
                    .or_default()
                    .insert(account_id.to_string(), candidate.clone());
                self.persist(&next).await?;
                *state = next;
                Ok(candidate)
            }
        }
    }

    async fn clear(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.contains_key(instance_id) {
            let mut next = state.clone();
            next.remove(instance_id);
            self.persist(&next).await?;
            *state = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn cursor(day: u32, id: &str) -> SyncCursor {
        SyncCursor {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            provider_id: Some(id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_memory_cursor_is_monotonic() {
        let store = MemoryCursorStore::new();
        assert!(store.get("i", "a").await.unwrap().is_none());

        store.advance("i", "a", cursor(5, "t5")).await.unwrap();
        let kept = store.advance("i", "a", cursor(3, "t3")).await.unwrap();
        assert_eq!(kept, cursor(5, "t5"));

        let moved = store.advance("i", "a", cursor(6, "t1")).await.unwrap();
        assert_eq!(moved, cursor(6, "t1"));

        store.advance("other", "a", cursor(1, "x")).await.unwrap();
        assert_eq!(store.all("i").await.unwrap().len(), 1);

        store.clear("i").await.unwrap();
        assert!(store.get("i", "a").await.unwrap().is_none());
        assert!(store.get("other", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_cursor_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cursors.json");

        {
            let store = FileCursorStore::open(&path).await.unwrap();
            store.advance("i", "a", cursor(5, "t5")).await.unwrap();
            store.advance("i", "a", cursor(2, "t2")).await.unwrap();
        }

        let reopened = FileCursorStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("i", "a").await.unwrap(), Some(cursor(5, "t5")));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_cursor_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = FileCursorStore::open(&path).await.err().unwrap();
        assert!(err.to_string().contains("Corrupt cursor file"));
    }
}
