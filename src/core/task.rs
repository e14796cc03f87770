//! 任务与生命周期状态机
//!
//! Created -> Queueing -> Processing -> Completed / Aborted；
//! Queueing 被移除时直接 Aborted；被抢占的任务可走 Processing -> Queueing 重新排队。
//! 异步移交（嵌套执行）期间状态保持 Processing，由嵌套执行负责终态。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 任务 ID（`task-<uuid>`）
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queueing,
    Processing,
    Completed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Aborted)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Queueing)
                | (Queueing, Processing)
                | (Queueing, Aborted)
                | (Processing, Completed)
                | (Processing, Aborted)
                | (Processing, Queueing)
        )
    }
}

/// 任务结束原因（随终态一起上报）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// DirectlyAnswer
    Answered,
    /// 工具调用后校验通过
    Satisfied,
    IterationBudgetExhausted,
    VerificationFailed,
    ReviewRejected,
    Cancelled,
    /// 被插队抢占
    Preempted,
    /// 排队中被手动移除
    Removed,
    Panicked,
    NestedCompleted,
    NestedFailed,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    result: Option<String>,
    finish_reason: Option<FinishReason>,
    errors: Vec<String>,
    async_execution: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// 一次用户请求对应的工作单元
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    input: String,
    created_at: DateTime<Utc>,
    focus_mode: Option<String>,
    cancel: CancellationToken,
    iteration: AtomicUsize,
    clarifications: AtomicUsize,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
}

impl Task {
    /// 创建任务；取消令牌是 parent 的子令牌（取消 agent 即取消全部任务）
    pub fn new(input: impl Into<String>, parent: &CancellationToken) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Created);
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            input: input.into(),
            created_at: Utc::now(),
            focus_mode: None,
            cancel: parent.child_token(),
            iteration: AtomicUsize::new(0),
            clarifications: AtomicUsize::new(0),
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                result: None,
                finish_reason: None,
                errors: Vec::new(),
                async_execution: None,
                finished_at: None,
            }),
            status_tx,
        }
    }

    pub fn with_focus_mode(mut self, mode: impl Into<String>) -> Self {
        self.focus_mode = Some(mode.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn focus_mode(&self) -> Option<&str> {
        self.focus_mode.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 触发取消；令牌一旦触发不会被重置
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// 状态迁移，返回迁移前的状态；非法迁移返回 IllegalTransition 且不修改状态
    pub fn transition(&self, next: TaskStatus) -> Result<TaskStatus, AgentError> {
        let prev = {
            let mut state = self.state();
            let prev = state.status;
            if !prev.can_transition_to(next) {
                return Err(AgentError::IllegalTransition { from: prev, to: next });
            }
            state.status = next;
            if next.is_terminal() {
                state.finished_at = Some(Utc::now());
            }
            prev
        };
        self.status_tx.send_replace(next);
        Ok(prev)
    }

    /// 进入终态并记录结束原因与结果（只有第一次成功生效）
    pub fn finish(
        &self,
        status: TaskStatus,
        reason: FinishReason,
        result: Option<String>,
    ) -> Result<TaskStatus, AgentError> {
        debug_assert!(status.is_terminal());
        let prev = self.transition(status)?;
        let mut state = self.state();
        state.finish_reason = Some(reason);
        if result.is_some() {
            state.result = result;
        }
        Ok(prev)
    }

    pub fn iteration(&self) -> usize {
        self.iteration.load(Ordering::SeqCst)
    }

    /// 迭代计数 +1，返回新的计数（从 1 开始）
    pub fn next_iteration(&self) -> usize {
        self.iteration.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clarification_count(&self) -> usize {
        self.clarifications.load(Ordering::SeqCst)
    }

    pub fn record_clarification(&self) -> usize {
        self.clarifications.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.state().errors.push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.state().errors.clone()
    }

    pub fn result(&self) -> Option<String> {
        self.state().result.clone()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.state().finish_reason
    }

    /// 当前持有的嵌套执行 id
    pub fn async_execution(&self) -> Option<String> {
        self.state().async_execution.clone()
    }

    pub fn set_async_execution(&self, execution_id: Option<String>) {
        self.state().async_execution = execution_id;
    }

    pub fn is_async_deferred(&self) -> bool {
        let state = self.state();
        state.status == TaskStatus::Processing && state.async_execution.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// 等待任务进入终态
    pub async fn wait_terminal(&self) -> TaskStatus {
        let mut rx = self.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state();
        TaskSnapshot {
            id: self.id.clone(),
            input: self.input.clone(),
            status: state.status,
            created_at: self.created_at,
            finished_at: state.finished_at,
            iteration: self.iteration(),
            focus_mode: self.focus_mode.clone(),
            result: state.result.clone(),
            finish_reason: state.finish_reason,
            async_execution: state.async_execution.clone(),
        }
    }
}

/// 任务只读快照（查询 / 事件用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub input: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub iteration: usize,
    pub focus_mode: Option<String>,
    pub result: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub async_execution: Option<String>,
}
