//! 时间线持久化
//!
//! TimelineStore：按 session id 保存 / 加载时间线快照。
//! - MemoryTimelineStore：进程内，测试与未配置存储时使用
//! - JsonFileTimelineStore：目录下每个会话一个 `<session>.json`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::TimelineSnapshot;

/// 时间线存储：save / load by session id
#[async_trait]
pub trait TimelineStore: Send + Sync {
    async fn save(&self, session_id: &str, snapshot: &TimelineSnapshot) -> Result<(), AgentError>;

    /// 不存在时返回 None
    async fn load(&self, session_id: &str) -> Result<Option<TimelineSnapshot>, AgentError>;
}

#[derive(Debug, Default)]
pub struct MemoryTimelineStore {
    sessions: Mutex<HashMap<String, TimelineSnapshot>>,
}

impl MemoryTimelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimelineStore for MemoryTimelineStore {
    async fn save(&self, session_id: &str, snapshot: &TimelineSnapshot) -> Result<(), AgentError> {
        self.sessions
            .lock()
            .map_err(|e| AgentError::Persistence(e.to_string()))?
            .insert(session_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<TimelineSnapshot>, AgentError> {
        Ok(self
            .sessions
            .lock()
            .map_err(|e| AgentError::Persistence(e.to_string()))?
            .get(session_id)
            .cloned())
    }
}

/// 单文件 JSON 持久化：`<dir>/<session>.json`
#[derive(Debug)]
pub struct JsonFileTimelineStore {
    dir: PathBuf,
}

impl JsonFileTimelineStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn save_blocking(path: &Path, snapshot: &TimelineSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("write timeline {}", path.display()))?;
        Ok(())
    }

    fn load_blocking(path: &Path) -> anyhow::Result<Option<TimelineSnapshot>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read timeline {}", path.display()))?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

#[async_trait]
impl TimelineStore for JsonFileTimelineStore {
    async fn save(&self, session_id: &str, snapshot: &TimelineSnapshot) -> Result<(), AgentError> {
        let path = self.path_for(session_id);
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || Self::save_blocking(&path, &snapshot))
            .await
            .map_err(|e| AgentError::Persistence(format!("Task join error: {e}")))??;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<TimelineSnapshot>, AgentError> {
        let path = self.path_for(session_id);
        let snapshot = tokio::task::spawn_blocking(move || Self::load_blocking(&path))
            .await
            .map_err(|e| AgentError::Persistence(format!("Task join error: {e}")))??;
        Ok(snapshot)
    }
}
