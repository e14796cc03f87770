//! SQLite 时间线存储
//!
//! 每个会话一行（session_id 主键），快照以 JSON 文本保存；I/O 放到 spawn_blocking 中执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::memory::{TimelineSnapshot, TimelineStore};

pub struct SqliteTimelineStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTimelineStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_timelines (
                session_id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("create session_timelines table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl TimelineStore for SqliteTimelineStore {
    async fn save(&self, session_id: &str, snapshot: &TimelineSnapshot) -> Result<(), AgentError> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        let json = serde_json::to_string(snapshot)
            .map_err(|e| AgentError::Persistence(format!("Failed to serialize timeline: {e}")))?;

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("sqlite lock poisoned: {e}"))?;
            conn.execute(
                "INSERT OR REPLACE INTO session_timelines (session_id, snapshot, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![session_id, json, chrono::Utc::now().to_rfc3339()],
            )
            .context("save timeline")?;
            Ok(())
        })
        .await
        .map_err(|e| AgentError::Persistence(format!("Task join error: {e}")))??;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<TimelineSnapshot>, AgentError> {
        let conn = self.conn.clone();
        let session_id = session_id.to_string();

        let row = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("sqlite lock poisoned: {e}"))?;
            let row = conn
                .query_row(
                    "SELECT snapshot FROM session_timelines WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("load timeline")?;
            Ok(row)
        })
        .await
        .map_err(|e| AgentError::Persistence(format!("Task join error: {e}")))??;

        row.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| AgentError::Persistence(format!("Failed to parse timeline: {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EntryKind, Timeline};

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.db");

        let t = Timeline::new(10, 1024);
        t.add(Some("task-1"), EntryKind::UserInput, "abc");
        t.add(Some("task-1"), EntryKind::Answer, "42");
        let snap = t.snapshot();

        {
            let store = SqliteTimelineStore::open(&path).unwrap();
            assert!(store.load("session-a").await.unwrap().is_none());
            store.save("session-a", &snap).await.unwrap();
            // 覆盖写
            store.save("session-a", &snap).await.unwrap();
        }

        let store = SqliteTimelineStore::open(&path).unwrap();
        assert_eq!(store.load("session-a").await.unwrap(), Some(snap));
        assert!(store.load("session-b").await.unwrap().is_none());
    }
}
