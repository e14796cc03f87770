//! 时间线：按时间顺序记录任务叙事（输入、思考、工具结果、澄清、回答、错误）
//!
//! 超过条数上限时淘汰最旧条目；单条内容超过字节上限时截断（按字符边界）。
//! 只有时间线（和累计摘要）会被持久化，任务对象本身不会。

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    UserInput,
    Thought,
    ToolResult,
    Clarification,
    Answer,
    Error,
    Plan,
    Blueprint,
    Summary,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::UserInput => "user_input",
            EntryKind::Thought => "thought",
            EntryKind::ToolResult => "tool_result",
            EntryKind::Clarification => "clarification",
            EntryKind::Answer => "answer",
            EntryKind::Error => "error",
            EntryKind::Plan => "plan",
            EntryKind::Blueprint => "blueprint",
            EntryKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub task_id: Option<String>,
    pub kind: EntryKind,
    pub content: String,
}

/// 可持久化的时间线快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub entries: Vec<TimelineEntry>,
    /// 模型维护的累计摘要
    pub summary: Option<String>,
    pub next_id: u64,
}

pub struct Timeline {
    inner: Mutex<TimelineSnapshot>,
    max_entries: usize,
    max_content_bytes: usize,
}

impl Timeline {
    pub fn new(max_entries: usize, max_content_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(TimelineSnapshot::default()),
            max_entries: max_entries.max(1),
            max_content_bytes,
        }
    }

    fn inner(&self) -> MutexGuard<'_, TimelineSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, task_id: Option<&str>, kind: EntryKind, content: impl AsRef<str>) -> u64 {
        let content = truncate_bytes(content.as_ref(), self.max_content_bytes);
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(TimelineEntry {
            id,
            at: Utc::now(),
            task_id: task_id.map(String::from),
            kind,
            content,
        });
        let overflow = inner.entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            inner.entries.drain(..overflow);
        }
        id
    }

    pub fn set_summary(&self, summary: impl Into<String>) {
        let summary = summary.into();
        if !summary.trim().is_empty() {
            self.inner().summary = Some(truncate_bytes(&summary, self.max_content_bytes));
        }
    }

    pub fn summary(&self) -> Option<String> {
        self.inner().summary.clone()
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().entries.is_empty()
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.inner().entries.clone()
    }

    /// 渲染为 prompt / 查询用文本
    pub fn dump(&self) -> String {
        let inner = self.inner();
        let mut out = String::new();
        if let Some(summary) = &inner.summary {
            out.push_str(&format!("[summary] {summary}\n"));
        }
        for e in &inner.entries {
            out.push_str(&format!(
                "{} [{}] {}\n",
                e.at.format("%H:%M:%S"),
                e.kind.as_str(),
                e.content
            ));
        }
        out
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        self.inner().clone()
    }

    pub fn restore(&self, mut snapshot: TimelineSnapshot) {
        let overflow = snapshot.entries.len().saturating_sub(self.max_entries);
        snapshot.entries.drain(..overflow);
        let max_id = snapshot.entries.iter().map(|e| e.id).max().unwrap_or(0);
        snapshot.next_id = snapshot.next_id.max(max_id);
        *self.inner() = snapshot;
    }
}

fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}
