//! 任务调度：单活动任务 + 取消 / 插队 / 移除控制
//!
//! 调度循环逐个取出队首任务交给 TaskRunner（主循环）处理，任一时刻最多一个任务处于 Processing。
//! 取任务、结束任务、插队、移除都在 control 锁下进行，保证「先取消再提拔」：
//! 被抢占的任务先结束为 Aborted，被提拔的任务才会进入 Processing。
//!
//! 任务处理边界捕获 panic，转为 Aborted 并记录错误，不影响调度器与其它任务。
//! 主循环移交给嵌套执行后（Deferred）任务仍显示为 Processing，但调度器不再占用它的槽位。

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::handoff::HandoffController;
use crate::core::task::{FinishReason, Task, TaskId, TaskStatus};
use crate::core::task_queue::{EnqueueOutcome, TaskQueue};
use crate::core::AgentError;
use crate::react::events::{EventEmitter, ReactEvent};

/// 已结束任务保留多少个以供查询
const FINISHED_RETENTION: usize = 256;

/// 主循环对一个任务的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// 正常停止（有回答时 result 为 Some）
    Finished {
        reason: FinishReason,
        result: Option<String>,
    },
    /// 已移交给嵌套执行，终态由它决定
    Deferred { execution_id: String },
    Cancelled,
}

/// 处理单个任务（主循环）
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Arc<Task>) -> LoopOutcome;
}

/// 进入终态并输出事件；非法迁移（已被别处结束）只记日志
pub(crate) fn finish_task(
    task: &Task,
    status: TaskStatus,
    reason: FinishReason,
    result: Option<String>,
    emitter: &EventEmitter,
) -> bool {
    match task.finish(status, reason, result) {
        Ok(from) => {
            tracing::info!(task_id = %task.id(), ?status, ?reason, "Task finished");
            emitter.emit(ReactEvent::TaskStatusChanged {
                task_id: task.id().to_string(),
                from,
                to: status,
            });
            emitter.emit(ReactEvent::TaskFinished {
                task_id: task.id().to_string(),
                status,
                reason,
                result: task.result(),
            });
            true
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id(), "Cannot finish task: {}", e);
            false
        }
    }
}

pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    current: Mutex<Option<Arc<Task>>>,
    control: tokio::sync::Mutex<()>,
    wake: Notify,
    preempted: Mutex<HashSet<TaskId>>,
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    finished: Mutex<VecDeque<TaskId>>,
    runner: Arc<dyn TaskRunner>,
    handoff: Arc<HandoffController>,
    emitter: EventEmitter,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskScheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        runner: Arc<dyn TaskRunner>,
        handoff: Arc<HandoffController>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            queue,
            current: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            preempted: Mutex::new(HashSet::new()),
            tasks: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            runner,
            handoff,
            emitter,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn current(&self) -> Option<Arc<Task>> {
        lock(&self.current).clone()
    }

    pub fn task(&self, task_id: &str) -> Option<Arc<Task>> {
        lock(&self.tasks).get(task_id).cloned()
    }

    /// 提交任务：跑入队 hook 后入队尾
    pub fn submit(&self, task: Arc<Task>) -> Result<EnqueueOutcome, AgentError> {
        let task_id = task.id().to_string();
        lock(&self.tasks).insert(task_id.clone(), task.clone());
        self.emitter.emit(ReactEvent::TaskCreated {
            task_id: task_id.clone(),
            input: task.input().to_string(),
        });

        match self.queue.append(task.clone()) {
            Ok(EnqueueOutcome::Queued) => {
                tracing::info!(task_id = %task_id, "Task enqueued");
                self.emitter.emit(ReactEvent::TaskStatusChanged {
                    task_id: task_id.clone(),
                    from: TaskStatus::Created,
                    to: TaskStatus::Queueing,
                });
                self.emitter.emit(ReactEvent::TaskEnqueued {
                    task_id,
                    position: "tail",
                });
                self.wake.notify_one();
                Ok(EnqueueOutcome::Queued)
            }
            Ok(EnqueueOutcome::Skipped { hook }) => {
                lock(&self.tasks).remove(&task_id);
                self.emitter.emit(ReactEvent::TaskSkipped {
                    task_id,
                    hook: hook.clone(),
                });
                Ok(EnqueueOutcome::Skipped { hook })
            }
            Err(e) => {
                lock(&self.tasks).remove(&task_id);
                self.emitter.emit(ReactEvent::TaskRejected {
                    task_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 调度循环：直到 shutdown 触发
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(queue = %self.queue.name(), "Scheduler started");
        while !shutdown.is_cancelled() {
            match self.next_task().await {
                Some(task) => self.process(task).await,
                None => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        tracing::info!(queue = %self.queue.name(), "Scheduler stopped");
    }

    /// 取出队首并置为 Processing（control 锁内，与插队 / 移除互斥）
    async fn next_task(&self) -> Option<Arc<Task>> {
        let _control = self.control.lock().await;
        loop {
            let task = self.queue.get_first()?;
            match task.transition(TaskStatus::Processing) {
                Ok(from) => {
                    *lock(&self.current) = Some(task.clone());
                    self.emitter.emit(ReactEvent::TaskStatusChanged {
                        task_id: task.id().to_string(),
                        from,
                        to: TaskStatus::Processing,
                    });
                    return Some(task);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id(), "Skipping dequeued task: {}", e);
                }
            }
        }
    }

    async fn process(&self, task: Arc<Task>) {
        let task_id = task.id().to_string();
        tracing::info!(task_id = %task_id, "Processing task");

        let outcome = AssertUnwindSafe(self.runner.run(task.clone()))
            .catch_unwind()
            .await;

        let _control = self.control.lock().await;
        let preempted = lock(&self.preempted).remove(&task_id);
        match outcome {
            Ok(LoopOutcome::Finished { reason, result }) => {
                finish_task(&task, TaskStatus::Completed, reason, result, &self.emitter);
            }
            Ok(LoopOutcome::Cancelled) => {
                let reason = if preempted {
                    FinishReason::Preempted
                } else {
                    FinishReason::Cancelled
                };
                finish_task(&task, TaskStatus::Aborted, reason, None, &self.emitter);
                self.emitter.emit(ReactEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
            }
            Ok(LoopOutcome::Deferred { execution_id }) => {
                tracing::info!(task_id = %task_id, execution_id = %execution_id, "Task handed off to nested execution");
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                task.record_error(format!("panic: {message}"));
                finish_task(&task, TaskStatus::Aborted, FinishReason::Panicked, None, &self.emitter);
                self.emitter
                    .error(Some(&task_id), format!("task panicked: {message}"));
            }
        }
        *lock(&self.current) = None;
        self.retire(&task_id);
    }

    /// 只保留最近结束的若干任务；移交中的任务留在记录里，等它进入终态后再淘汰
    fn retire(&self, task_id: &str) {
        let mut finished = lock(&self.finished);
        finished.push_back(task_id.to_string());
        if finished.len() <= FINISHED_RETENTION {
            return;
        }
        let mut excess = finished.len() - FINISHED_RETENTION;
        let mut tasks = lock(&self.tasks);
        finished.retain(|id| {
            if excess == 0 {
                return true;
            }
            match tasks.get(id) {
                Some(t) if !t.status().is_terminal() => true,
                _ => {
                    tasks.remove(id);
                    excess -= 1;
                    false
                }
            }
        });
    }

    /// 取消当前任务（task_id 为 None 时取消任何当前任务）；
    /// 目标是移交中的任务时取消其嵌套执行
    pub async fn cancel_task(&self, task_id: Option<&str>) -> Result<TaskId, AgentError> {
        let _control = self.control.lock().await;
        if let Some(current) = self.current() {
            if task_id.map_or(true, |id| id == current.id()) {
                tracing::info!(task_id = %current.id(), "Cancelling current task");
                current.cancel();
                return Ok(current.id().to_string());
            }
        }
        if let Some(id) = task_id {
            if self.handoff.cancel(id) {
                return Ok(id.to_string());
            }
        }
        Err(AgentError::TaskNotFound(
            task_id.unwrap_or("(current)").to_string(),
        ))
    }

    /// 插队：取消当前任务，把目标任务移到队首
    pub async fn jump_queue(&self, task_id: &str) -> Result<(), AgentError> {
        let _control = self.control.lock().await;
        let task = self
            .queue
            .take(task_id)
            .ok_or_else(|| AgentError::TaskNotFound(task_id.to_string()))?;

        let preempted = self.current();
        if let Some(current) = &preempted {
            tracing::info!(task_id = %current.id(), by = %task_id, "Preempting current task");
            lock(&self.preempted).insert(current.id().to_string());
            current.cancel();
        }

        match self.queue.prepend_to_first(task.clone()) {
            Ok(EnqueueOutcome::Queued) => {
                self.emitter.emit(ReactEvent::TaskEnqueued {
                    task_id: task_id.to_string(),
                    position: "head",
                });
                self.emitter.emit(ReactEvent::TaskJumped {
                    task_id: task_id.to_string(),
                    preempted: preempted.map(|t| t.id().to_string()),
                });
                self.wake.notify_one();
                Ok(())
            }
            Ok(EnqueueOutcome::Skipped { hook }) => {
                // 摘出后被 hook 否决：任务不会再运行
                finish_task(&task, TaskStatus::Aborted, FinishReason::Removed, None, &self.emitter);
                self.emitter.emit(ReactEvent::TaskSkipped {
                    task_id: task_id.to_string(),
                    hook,
                });
                self.retire(task_id);
                Ok(())
            }
            Err(e) => {
                finish_task(&task, TaskStatus::Aborted, FinishReason::Removed, None, &self.emitter);
                self.retire(task_id);
                Err(e)
            }
        }
    }

    /// 移除排队中的任务；正在处理的任务不能移除
    pub async fn remove_task(&self, task_id: &str) -> Result<(), AgentError> {
        let _control = self.control.lock().await;
        let task = self
            .queue
            .remove(task_id)
            .ok_or_else(|| AgentError::TaskNotFound(task_id.to_string()))?;
        tracing::info!(task_id, "Task removed from queue");
        finish_task(&task, TaskStatus::Aborted, FinishReason::Removed, None, &self.emitter);
        self.retire(task_id);
        Ok(())
    }

    /// 当前任务与排队任务快照
    pub fn queue_state(&self) -> ReactEvent {
        ReactEvent::QueueState {
            current: self.current().map(|t| t.snapshot()),
            queued: self.queue.get_all().iter().map(|t| t.snapshot()).collect(),
        }
    }

    /// 排队中的任务 id（按顺序）
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.queue
            .get_all()
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    /// 关闭：取消当前任务与所有排队任务
    pub async fn shutdown(&self) {
        let _control = self.control.lock().await;
        if let Some(current) = self.current() {
            current.cancel();
        }
        for task in self.queue.get_all() {
            if self.queue.take(task.id()).is_some() {
                task.cancel();
                finish_task(&task, TaskStatus::Aborted, FinishReason::Cancelled, None, &self.emitter);
                self.retire(task.id());
            }
        }
        for task in self.handoff.deferred_tasks() {
            task.cancel();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
