//! 任务队列
//!
//! 有序（默认 FIFO）任务序列 + 构造时注册的入队 / 出队 hook：
//! - 入队 hook 按注册顺序执行，可否决（Skip，静默丢弃）或报错（错误返回给调用方）
//! - 出队 hook 只做观察，GetFirst 触发 `dequeue`，Remove 触发 `manual_remove`
//!
//! 结构锁只包住结构变更，hook 在结构锁之外执行（hook 可以读取队列状态）。
//! 另有一把入队闸门串行化「hook 评估 + 入队」，保证 hook 观察到的顺序与入队顺序一致；
//! 因此入队 hook 内不得再调用 append / prepend_to_first。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskStatus};
use crate::core::AgentError;

/// 入队 hook 的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Queue,
    /// 不入队且不报错
    Skip,
}

/// 出队原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueReason {
    Dequeue,
    ManualRemove,
}

impl DequeueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DequeueReason::Dequeue => "dequeue",
            DequeueReason::ManualRemove => "manual_remove",
        }
    }
}

/// 入队结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// 被指定名称的 hook 否决
    Skipped { hook: String },
}

type EnqueueHookFn = dyn Fn(&Task) -> Result<HookDecision, String> + Send + Sync;
type DequeueHookFn = dyn Fn(&Task, DequeueReason) + Send + Sync;

struct EnqueueHook {
    name: String,
    f: Box<EnqueueHookFn>,
}

/// 任务队列（每个 agent 实例一个，注入到需要它的组件）
pub struct TaskQueue {
    name: String,
    tasks: Mutex<VecDeque<Arc<Task>>>,
    enqueue_gate: Mutex<()>,
    enqueue_hooks: Vec<EnqueueHook>,
    dequeue_hooks: Vec<Box<DequeueHookFn>>,
}

/// 构造 TaskQueue 并按顺序注册 hook
pub struct TaskQueueBuilder {
    name: String,
    enqueue_hooks: Vec<EnqueueHook>,
    dequeue_hooks: Vec<Box<DequeueHookFn>>,
}

impl TaskQueueBuilder {
    pub fn on_enqueue<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Task) -> Result<HookDecision, String> + Send + Sync + 'static,
    {
        self.enqueue_hooks.push(EnqueueHook {
            name: name.into(),
            f: Box::new(f),
        });
        self
    }

    pub fn on_dequeue<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task, DequeueReason) + Send + Sync + 'static,
    {
        self.dequeue_hooks.push(Box::new(f));
        self
    }

    pub fn build(self) -> TaskQueue {
        TaskQueue {
            name: self.name,
            tasks: Mutex::new(VecDeque::new()),
            enqueue_gate: Mutex::new(()),
            enqueue_hooks: self.enqueue_hooks,
            dequeue_hooks: self.dequeue_hooks,
        }
    }
}

enum Position {
    Tail,
    Head,
}

impl TaskQueue {
    pub fn builder(name: impl Into<String>) -> TaskQueueBuilder {
        TaskQueueBuilder {
            name: name.into(),
            enqueue_hooks: Vec::new(),
            dequeue_hooks: Vec::new(),
        }
    }

    /// 无 hook 的队列
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 追加到队尾
    pub fn append(&self, task: Arc<Task>) -> Result<EnqueueOutcome, AgentError> {
        self.enqueue(task, Position::Tail)
    }

    /// 插到队首（仅用于插队抢占）
    pub fn prepend_to_first(&self, task: Arc<Task>) -> Result<EnqueueOutcome, AgentError> {
        self.enqueue(task, Position::Head)
    }

    fn enqueue(&self, task: Arc<Task>, position: Position) -> Result<EnqueueOutcome, AgentError> {
        let _gate = self
            .enqueue_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for hook in &self.enqueue_hooks {
            match (hook.f)(&task) {
                Ok(HookDecision::Queue) => {}
                Ok(HookDecision::Skip) => {
                    tracing::info!(
                        queue = %self.name,
                        task_id = %task.id(),
                        hook = %hook.name,
                        "Task skipped by enqueue hook"
                    );
                    return Ok(EnqueueOutcome::Skipped {
                        hook: hook.name.clone(),
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        queue = %self.name,
                        task_id = %task.id(),
                        hook = %hook.name,
                        "Enqueue hook rejected task: {}",
                        reason
                    );
                    return Err(AgentError::EnqueueRejected {
                        hook: hook.name.clone(),
                        reason,
                    });
                }
            }
        }

        if task.status() != TaskStatus::Queueing {
            task.transition(TaskStatus::Queueing)?;
        }

        let mut tasks = self.tasks();
        match position {
            Position::Tail => tasks.push_back(task),
            Position::Head => tasks.push_front(task),
        }
        Ok(EnqueueOutcome::Queued)
    }

    /// 原子地取出队首
    pub fn get_first(&self) -> Option<Arc<Task>> {
        let task = self.tasks().pop_front()?;
        self.fire_dequeue(&task, DequeueReason::Dequeue);
        Some(task)
    }

    /// 手动移除；不存在时返回 None
    pub fn remove(&self, task_id: &str) -> Option<Arc<Task>> {
        let task = self.take(task_id)?;
        self.fire_dequeue(&task, DequeueReason::ManualRemove);
        Some(task)
    }

    /// 从序列中摘出任务但不触发出队 hook（插队时搬移用）
    pub(crate) fn take(&self, task_id: &str) -> Option<Arc<Task>> {
        let mut tasks = self.tasks();
        let idx = tasks.iter().position(|t| t.id() == task_id)?;
        tasks.remove(idx)
    }

    fn fire_dequeue(&self, task: &Task, reason: DequeueReason) {
        for hook in &self.dequeue_hooks {
            hook(task, reason);
        }
    }

    pub fn peek(&self) -> Option<Arc<Task>> {
        self.tasks().front().cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Task>> {
        self.tasks().iter().cloned().collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks().iter().any(|t| t.id() == task_id)
    }

    /// 清空，不触发 hook
    pub fn clear(&self) {
        self.tasks().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }
}
