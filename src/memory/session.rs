//! 会话时间线：时间线 + 可选的按 session id 持久化

use std::sync::Arc;

use crate::memory::{Timeline, TimelineStore};

pub struct SessionTimeline {
    timeline: Timeline,
    store: Option<Arc<dyn TimelineStore>>,
    session_id: Option<String>,
}

impl SessionTimeline {
    pub fn new(
        timeline: Timeline,
        store: Option<Arc<dyn TimelineStore>>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            timeline,
            store,
            session_id,
        }
    }

    /// 不持久化
    pub fn ephemeral(timeline: Timeline) -> Self {
        Self::new(timeline, None, None)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// 从存储恢复；返回是否恢复了已有会话
    pub async fn load(&self) -> bool {
        let (Some(store), Some(session_id)) = (&self.store, &self.session_id) else {
            return false;
        };
        match store.load(session_id).await {
            Ok(Some(snapshot)) => {
                tracing::info!(session_id = %session_id, entries = snapshot.entries.len(), "Timeline restored");
                self.timeline.restore(snapshot);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Failed to load timeline: {}", e);
                false
            }
        }
    }

    /// 保存当前快照；失败只记日志
    pub async fn persist(&self) {
        let (Some(store), Some(session_id)) = (&self.store, &self.session_id) else {
            return;
        };
        if let Err(e) = store.save(session_id, &self.timeline.snapshot()).await {
            tracing::warn!(session_id = %session_id, "Failed to persist timeline: {}", e);
        }
    }
}
