//! Atomic, crash-safe session persistence, one JSON file per
//! task. The write path mirrors [`crate::event_log::MemoryEventLog::overwrite`]:
//! write to a `.tmp` sibling, flush, fsync, rename over the final name.

use std::path::{Path, PathBuf};

use aigent_llm::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub task_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Directory-backed store; one file per session, keyed by a sanitized
/// task id. A single mutex serializes writes; reads take a read lock so
/// file renames provide atomicity against concurrent readers.
pub struct SessionStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: RwLock::new(()) }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(task_id)))
    }

    pub async fn save(&self, mut data: SessionData) -> Result<(), SessionStoreError> {
        let _guard = self.lock.write().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&data.task_id);
        if data.created_at == DateTime::<Utc>::UNIX_EPOCH {
            data.created_at = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => serde_json::from_str::<SessionData>(&raw).map(|d| d.created_at).unwrap_or_else(|_| Utc::now()),
                Err(_) => Utc::now(),
            };
        }
        data.updated_at = Utc::now();

        let tmp_path = path.with_file_name(format!(
            "{}.tmp",
            path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default()
        ));

        let write_result: Result<(), SessionStoreError> = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path).await?;
            let rendered = serde_json::to_string_pretty(&data)?;
            file.write_all(rendered.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<SessionData>, SessionStoreError> {
        let _guard = self.lock.read().await;
        let path = self.path_for(task_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<String>, SessionStoreError> {
        let _guard = self.lock.read().await;
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    pub async fn delete(&self, task_id: &str) -> Result<(), SessionStoreError> {
        let _guard = self.lock.write().await;
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every session whose `updated_at` is older than `max_age`.
    /// Returns the number deleted.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> Result<usize, SessionStoreError> {
        let ids = self.list().await?;
        let cutoff = Utc::now() - max_age;
        let mut deleted = 0;
        for id in ids {
            if let Some(data) = self.load(&id).await? {
                if data.updated_at != DateTime::<Utc>::UNIX_EPOCH && data.updated_at < cutoff {
                    self.delete(&id).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

fn sanitize(task_id: &str) -> String {
    task_id.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' }).collect()
}

fn blank_session(task_id: &str) -> SessionData {
    SessionData {
        task_id: task_id.to_string(),
        messages: Vec::new(),
        summary: None,
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

pub fn new_session(task_id: &str, messages: Vec<ChatMessage>, summary: Option<String>) -> SessionData {
    SessionData { messages, summary, ..blank_session(task_id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("task/with slashes!"), "task_with_slashes_");
        assert_eq!(sanitize("safe-task_1.v2"), "safe-task_1.v2");
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = SessionStore::new(dir().path());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_fields() {
        let store = SessionStore::new(dir().path());
        let data = new_session("task-1", vec![ChatMessage::user("hi")], Some("s".to_string()));
        store.save(data).await.unwrap();

        let loaded = store.load("task-1").await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "task-1");
        assert_eq!(loaded.summary.as_deref(), Some("s"));
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn created_at_is_preserved_across_saves() {
        let store = SessionStore::new(dir().path());
        store.save(new_session("task-1", vec![], None)).await.unwrap();
        let first = store.load("task-1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save(new_session("task-1", vec![ChatMessage::user("more")], Some("updated".into()))).await.unwrap();
        let second = store.load("task-1").await.unwrap().unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn list_returns_all_saved_task_ids() {
        let store = SessionStore::new(dir().path());
        store.save(new_session("a", vec![], None)).await.unwrap();
        store.save(new_session("b", vec![], None)).await.unwrap();
        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = SessionStore::new(dir().path());
        assert!(store.delete("does-not-exist").await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_removes_sessions_older_than_max_age() {
        let store = SessionStore::new(dir().path());
        let mut old = new_session("old", vec![], None);
        old.updated_at = Utc::now() - chrono::Duration::days(10);
        old.created_at = old.updated_at;
        // Bypass save()'s "set updated_at = now" by writing the file directly.
        let path = store.path_for("old");
        tokio::fs::create_dir_all(&store.dir).await.unwrap();
        tokio::fs::write(&path, serde_json::to_string(&old).unwrap()).await.unwrap();

        store.save(new_session("fresh", vec![], None)).await.unwrap();

        let deleted = store.cleanup(chrono::Duration::days(1)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("fresh").await.unwrap().is_some());
    }
}
