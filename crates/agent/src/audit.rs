//! NDJSON audit event emission. The sink itself
//! is an external collaborator.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Appends one NDJSON line per event. A mutex serializes concurrent
/// emitters onto the single underlying file handle, mirroring the
/// open-append-flush-fsync sequence in [`aigent_memory::event_log`].
pub struct NdjsonAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NdjsonAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }
}

#[async_trait]
impl AuditSink for NdjsonAuditSink {
    async fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        let line = serde_json::to_string(&event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let sink = NdjsonAuditSink::new(&path);

        sink.emit(AuditEvent { ts: Utc::now(), event: "tool_call".into(), correlation_id: Some("c1".into()), task_id: Some("t1".into()), fields: None })
            .await
            .unwrap();
        sink.emit(AuditEvent { ts: Utc::now(), event: "llm_call".into(), correlation_id: None, task_id: None, fields: None })
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("tool_call"));
        assert!(lines[1].contains("llm_call"));
    }

    #[tokio::test]
    async fn emit_serializes_optional_fields_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let sink = NdjsonAuditSink::new(&path);
        sink.emit(AuditEvent { ts: Utc::now(), event: "boot".into(), correlation_id: None, task_id: None, fields: None }).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!contents.contains("correlation_id"));
        assert!(!contents.contains("task_id"));
    }
}
