//! 记忆层：时间线与按会话持久化

pub mod persistence;
pub mod session;
pub mod sqlite;
pub mod timeline;

use std::path::PathBuf;
use std::sync::Arc;

pub use persistence::{JsonFileTimelineStore, MemoryTimelineStore, TimelineStore};
pub use session::SessionTimeline;
pub use sqlite::SqliteTimelineStore;
pub use timeline::{EntryKind, Timeline, TimelineEntry, TimelineSnapshot};

use crate::config::{SessionSection, StoreKind};

/// 按 [session] 配置创建时间线存储；未设置 session_id 时不持久化
pub fn create_store_from_config(
    cfg: &SessionSection,
) -> anyhow::Result<Option<Arc<dyn TimelineStore>>> {
    if cfg.session_id.is_none() {
        return Ok(None);
    }
    let store: Arc<dyn TimelineStore> = match cfg.store {
        StoreKind::Memory => Arc::new(MemoryTimelineStore::new()),
        StoreKind::Json => Arc::new(JsonFileTimelineStore::new(
            cfg.store_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("sessions")),
        )),
        StoreKind::Sqlite => Arc::new(SqliteTimelineStore::open(
            cfg.store_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("sessions/timeline.db")),
        )?),
    };
    Ok(Some(store))
}
