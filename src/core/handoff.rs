//! 异步移交：把任务的终态决定权交给后台嵌套执行（计划执行 / 蓝图执行）
//!
//! start 为嵌套执行创建子令牌与镜像输入通道，后台启动后立即返回；主循环随即退出，
//! 调度器继续处理下一个任务。嵌套执行结束时：成功 -> Completed，失败 / panic -> Aborted，
//! 取消 -> Aborted(cancelled)，并清除任务上的嵌套执行指针。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::InputEvent;
use crate::core::task_scheduler::finish_task;
use crate::core::task::{FinishReason, Task, TaskId, TaskStatus};
use crate::core::AgentError;
use crate::memory::{EntryKind, SessionTimeline};
use crate::react::events::{EventEmitter, ReactEvent};

/// 嵌套执行请求
#[derive(Debug, Clone, PartialEq)]
pub enum NestedRequest {
    Plan { payload: String },
    Blueprint { name: String, params: Value },
}

impl NestedRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            NestedRequest::Plan { .. } => "plan",
            NestedRequest::Blueprint { .. } => "blueprint",
        }
    }
}

/// 交给嵌套执行的上下文
pub struct NestedContext {
    pub execution_id: String,
    pub parent_task_id: TaskId,
    pub input: String,
    /// 子令牌：父任务取消时一并取消
    pub cancel: CancellationToken,
    /// 转发给父任务的外部输入
    pub inputs: mpsc::UnboundedReceiver<InputEvent>,
    pub emitter: EventEmitter,
}

/// 嵌套执行（计划执行器、蓝图执行器）
#[async_trait]
pub trait NestedExecutor: Send + Sync {
    async fn execute(&self, request: NestedRequest, ctx: NestedContext) -> Result<String, String>;
}

struct ActiveExecution {
    execution_id: String,
    task: Arc<Task>,
    mirror: mpsc::UnboundedSender<InputEvent>,
}

pub struct HandoffController {
    executor: Option<Arc<dyn NestedExecutor>>,
    active: Mutex<HashMap<TaskId, ActiveExecution>>,
    session: Arc<SessionTimeline>,
    emitter: EventEmitter,
}

impl HandoffController {
    pub fn new(
        executor: Option<Arc<dyn NestedExecutor>>,
        session: Arc<SessionTimeline>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            executor,
            active: Mutex::new(HashMap::new()),
            session,
            emitter,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveExecution>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 是否配置了嵌套执行器
    pub fn is_enabled(&self) -> bool {
        self.executor.is_some()
    }

    pub fn has_active(&self, task_id: &str) -> bool {
        self.active().contains_key(task_id)
    }

    /// 启动嵌套执行并返回 execution id；同一任务不允许嵌套第二个执行
    pub fn start(self: &Arc<Self>, task: &Arc<Task>, request: NestedRequest) -> Result<String, AgentError> {
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| AgentError::NestedExecutionFailed("no nested executor configured".into()))?;
        let execution_id = format!("nested-{}", uuid::Uuid::new_v4());
        let cancel = task.cancel_token().child_token();
        let (mirror, inputs) = mpsc::unbounded_channel();

        {
            let mut active = self.active();
            if active.contains_key(task.id()) || task.async_execution().is_some() {
                return Err(AgentError::NestedExecutionActive(task.id().to_string()));
            }
            task.set_async_execution(Some(execution_id.clone()));
            active.insert(
                task.id().to_string(),
                ActiveExecution {
                    execution_id: execution_id.clone(),
                    task: task.clone(),
                    mirror,
                },
            );
        }

        let kind = request.kind();
        let entry_kind = match &request {
            NestedRequest::Plan { .. } => EntryKind::Plan,
            NestedRequest::Blueprint { .. } => EntryKind::Blueprint,
        };
        let description = match &request {
            NestedRequest::Plan { payload } => payload.clone(),
            NestedRequest::Blueprint { name, params } => format!("{name} {params}"),
        };
        self.session
            .timeline()
            .add(Some(task.id()), entry_kind, description);
        tracing::info!(task_id = %task.id(), execution_id = %execution_id, kind, "Nested execution started");
        self.emitter.emit(ReactEvent::AsyncStarted {
            task_id: task.id().to_string(),
            execution_id: execution_id.clone(),
            kind: kind.to_string(),
        });

        let ctx = NestedContext {
            execution_id: execution_id.clone(),
            parent_task_id: task.id().to_string(),
            input: task.input().to_string(),
            cancel: cancel.clone(),
            inputs,
            emitter: self.emitter.clone(),
        };
        let this = Arc::clone(self);
        let task = Arc::clone(task);
        let id = execution_id.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(executor.execute(request, ctx)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                out = run => match out {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) => Err(AgentError::NestedExecutionFailed(e)),
                    Err(_) => Err(AgentError::NestedExecutionFailed("nested execution panicked".into())),
                },
            };
            this.complete(&task, &id, result).await;
        });

        Ok(execution_id)
    }

    async fn complete(&self, task: &Arc<Task>, execution_id: &str, result: Result<String, AgentError>) {
        self.active().remove(task.id());
        task.set_async_execution(None);
        let success = result.is_ok();
        let timeline = self.session.timeline();

        match result {
            Ok(text) => {
                timeline.add(Some(task.id()), EntryKind::Answer, &text);
                self.emitter.emit(ReactEvent::Result {
                    task_id: task.id().to_string(),
                    content: text.clone(),
                });
                finish_task(task, TaskStatus::Completed, FinishReason::NestedCompleted, Some(text), &self.emitter);
            }
            Err(AgentError::Cancelled) => {
                finish_task(task, TaskStatus::Aborted, FinishReason::Cancelled, None, &self.emitter);
                self.emitter.emit(ReactEvent::TaskCancelled {
                    task_id: task.id().to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id(), execution_id, "Nested execution failed: {}", e);
                task.record_error(e.to_string());
                timeline.add(Some(task.id()), EntryKind::Error, e.to_string());
                finish_task(task, TaskStatus::Aborted, FinishReason::NestedFailed, None, &self.emitter);
            }
        }
        self.emitter.emit(ReactEvent::AsyncFinished {
            task_id: task.id().to_string(),
            execution_id: execution_id.to_string(),
            success,
        });
        self.session.persist().await;
    }

    /// 转发给指定任务的嵌套执行；没有活动执行时返回 false
    pub fn forward(&self, task_id: &str, event: InputEvent) -> bool {
        match self.active().get(task_id) {
            Some(exec) => exec.mirror.send(event).is_ok(),
            None => false,
        }
    }

    /// 转发给所有活动的嵌套执行（归属未知的审核回应）
    pub fn forward_any(&self, event: InputEvent) -> bool {
        let active = self.active();
        let mut delivered = false;
        for exec in active.values() {
            delivered |= exec.mirror.send(event.clone()).is_ok();
        }
        delivered
    }

    /// 取消任务的嵌套执行（取消任务令牌，连带取消子令牌）
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.active().get(task_id) {
            Some(exec) => {
                tracing::info!(task_id, execution_id = %exec.execution_id, "Cancelling nested execution");
                exec.task.cancel();
                true
            }
            None => false,
        }
    }

    /// 正在进行嵌套执行的任务
    pub fn deferred_tasks(&self) -> Vec<Arc<Task>> {
        self.active().values().map(|e| e.task.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::Timeline;

    /// 等待输入或取消；收到 "fail" 失败，收到其它文本成功
    struct WaitForInput;

    #[async_trait]
    impl NestedExecutor for WaitForInput {
        async fn execute(&self, _request: NestedRequest, mut ctx: NestedContext) -> Result<String, String> {
            match ctx.inputs.recv().await {
                Some(InputEvent::FreeInput { text, .. }) if text == "fail" => Err("failed".into()),
                Some(InputEvent::FreeInput { text, .. }) => Ok(text),
                _ => Err("input closed".into()),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl NestedExecutor for Panics {
        async fn execute(&self, _: NestedRequest, _: NestedContext) -> Result<String, String> {
            panic!("boom");
        }
    }

    fn controller(executor: Arc<dyn NestedExecutor>) -> Arc<HandoffController> {
        Arc::new(HandoffController::new(
            Some(executor),
            Arc::new(SessionTimeline::ephemeral(Timeline::new(10, 1024))),
            EventEmitter::noop(),
        ))
    }

    fn processing_task() -> Arc<Task> {
        let task = Arc::new(Task::new("plan it", &CancellationToken::new()));
        task.transition(TaskStatus::Queueing).unwrap();
        task.transition(TaskStatus::Processing).unwrap();
        task
    }

    fn plan() -> NestedRequest {
        NestedRequest::Plan {
            payload: "steps".into(),
        }
    }

    #[tokio::test]
    async fn test_success_completes_parent() {
        let handoff = controller(Arc::new(WaitForInput));
        let task = processing_task();
        handoff.start(&task, plan()).unwrap();
        assert!(task.is_async_deferred());
        // 已有嵌套执行时不能再启动
        assert!(matches!(
            handoff.start(&task, plan()),
            Err(AgentError::NestedExecutionActive(_))
        ));
        assert!(handoff.forward(task.id(), InputEvent::free("report")));

        let status = tokio::time::timeout(Duration::from_secs(1), task.wait_terminal())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(task.result().as_deref(), Some("report"));
        assert_eq!(task.finish_reason(), Some(FinishReason::NestedCompleted));
        assert!(task.async_execution().is_none());
        assert!(!handoff.has_active(task.id()));
    }

    #[tokio::test]
    async fn test_failure_and_panic_abort_parent() {
        let handoff = controller(Arc::new(WaitForInput));
        let task = processing_task();
        handoff.start(&task, plan()).unwrap();
        handoff.forward_any(InputEvent::free("fail"));
        let status = tokio::time::timeout(Duration::from_secs(1), task.wait_terminal())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Aborted);
        assert_eq!(task.finish_reason(), Some(FinishReason::NestedFailed));

        let handoff = controller(Arc::new(Panics));
        let task = processing_task();
        handoff.start(&task, plan()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task.wait_terminal())
            .await
            .unwrap();
        assert_eq!(task.finish_reason(), Some(FinishReason::NestedFailed));
        assert!(!task.errors().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_parent() {
        let handoff = controller(Arc::new(WaitForInput));
        let task = processing_task();
        handoff.start(&task, plan()).unwrap();
        assert!(handoff.cancel(task.id()));
        tokio::time::timeout(Duration::from_secs(1), task.wait_terminal())
            .await
            .unwrap();
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.finish_reason(), Some(FinishReason::Cancelled));
        assert!(!handoff.cancel(task.id()));
    }

    #[tokio::test]
    async fn test_disabled_without_executor() {
        let handoff = Arc::new(HandoffController::new(
            None,
            Arc::new(SessionTimeline::ephemeral(Timeline::new(10, 1024))),
            EventEmitter::noop(),
        ));
        assert!(!handoff.is_enabled());
        assert!(handoff.start(&processing_task(), plan()).is_err());
    }
}
