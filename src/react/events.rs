//! 输出事件：任务生命周期、审核点生命周期与分发进度
//!
//! 每个状态迁移都是一个独立事件，序列化为带 `type` 标签的 JSON（供前端 / 日志消费）。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::task::{FinishReason, TaskSnapshot, TaskStatus};
use crate::core::task_queue::DequeueReason;
use crate::review::CheckpointKind;

/// 单个输出事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    TaskCreated {
        task_id: String,
        input: String,
    },
    /// 入队成功；position 为 tail（Append）或 head（插队）
    TaskEnqueued {
        task_id: String,
        position: &'static str,
    },
    /// 入队 hook 否决（静默丢弃）
    TaskSkipped {
        task_id: String,
        hook: String,
    },
    TaskRejected {
        task_id: String,
        reason: String,
    },
    TaskDequeued {
        task_id: String,
        reason: DequeueReason,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskFinished {
        task_id: String,
        status: TaskStatus,
        reason: FinishReason,
        result: Option<String>,
    },
    /// 取消确认
    TaskCancelled {
        task_id: String,
    },
    TaskJumped {
        task_id: String,
        preempted: Option<String>,
    },
    ReviewRequired {
        checkpoint_id: String,
        task_id: Option<String>,
        kind: CheckpointKind,
        materials: serde_json::Value,
    },
    ReviewReleased {
        checkpoint_id: String,
        params: serde_json::Value,
    },
    Iteration {
        task_id: String,
        current: usize,
        max: usize,
    },
    Thought {
        task_id: String,
        text: String,
    },
    Action {
        task_id: String,
        action: String,
    },
    ToolCallStart {
        task_id: String,
        tool: String,
        params: serde_json::Value,
    },
    ToolCallDone {
        task_id: String,
        tool: String,
        preview: String,
        duration_ms: u64,
    },
    ToolCallFailed {
        task_id: String,
        tool: String,
        reason: String,
    },
    /// 任务结果（直接回答或校验通过后的结论）
    Result {
        task_id: String,
        content: String,
    },
    AsyncStarted {
        task_id: String,
        execution_id: String,
        kind: String,
    },
    AsyncFinished {
        task_id: String,
        execution_id: String,
        success: bool,
    },
    QueueState {
        current: Option<TaskSnapshot>,
        queued: Vec<TaskSnapshot>,
    },
    Timeline {
        dump: String,
    },
    Warning {
        task_id: Option<String>,
        text: String,
    },
    Error {
        task_id: Option<String>,
        text: String,
    },
}

/// 事件发送端：未连接接收端时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<ReactEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ReactEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 创建发送端与对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReactEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// 不输出任何事件
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ReactEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn warn(&self, task_id: Option<&str>, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(task_id = ?task_id, "{}", text);
        self.emit(ReactEvent::Warning {
            task_id: task_id.map(String::from),
            text,
        });
    }

    pub fn error(&self, task_id: Option<&str>, text: impl Into<String>) {
        let text = text.into();
        tracing::error!(task_id = ?task_id, "{}", text);
        self.emit(ReactEvent::Error {
            task_id: task_id.map(String::from),
            text,
        });
    }
}

/// 截断预览文本（按字符）
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
