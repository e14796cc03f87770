//! 输入面：外部输入事件与消费循环
//!
//! 三类输入：自由文本（创建任务并入队）、按审核点 id 的交互回应（释放审核点）、
//! 按任务 id 的控制信号（取消 / 插队 / 移除 / 查询队列 / 查询时间线）。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;

/// 控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSignal {
    CancelCurrentTask,
    JumpQueue,
    RemoveTask,
    QueryQueue,
    QueryTimeline,
}

/// 外部输入事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    FreeInput {
        text: String,
        #[serde(default)]
        focus_mode: Option<String>,
    },
    InteractiveResponse {
        checkpoint_id: String,
        /// 任意 JSON；字符串视为 `{"answer": ...}`
        #[serde(default)]
        params: Value,
    },
    Sync {
        signal: SyncSignal,
        #[serde(default)]
        task_id: Option<String>,
    },
}

impl InputEvent {
    pub fn free(text: impl Into<String>) -> Self {
        InputEvent::FreeInput {
            text: text.into(),
            focus_mode: None,
        }
    }

    pub fn sync(signal: SyncSignal, task_id: Option<&str>) -> Self {
        InputEvent::Sync {
            signal,
            task_id: task_id.map(String::from),
        }
    }
}

/// 解析一行输入：JSON 事件，或把非 JSON 文本当作自由输入；空行返回 None
pub fn parse_input_line(line: &str) -> Option<InputEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{') {
        match serde_json::from_str::<InputEvent>(line) {
            Ok(event) => return Some(event),
            Err(e) => tracing::debug!("Input line is not an event ({}), treating as text", e),
        }
    }
    Some(InputEvent::free(line))
}

/// 后台消费输入事件，直到通道关闭或 shutdown 触发
pub fn spawn_input_loop(
    agent: Arc<Agent>,
    mut rx: mpsc::UnboundedReceiver<InputEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = rx.recv() => agent.handle_input(event).await,
                else => break,
            }
        }
        tracing::debug!("Input loop stopped");
    })
}
