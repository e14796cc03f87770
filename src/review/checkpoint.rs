//! 审核点（Endpoint）：一次「请人 / 自动审核员批准」的阻塞汇合点
//!
//! 状态 Created -> Waiting -> Released。基于 oneshot：
//! - release 只能成功一次，第二次返回 CheckpointAlreadyReleased
//! - release 先于 wait 时，wait 立即返回已投递的参数
//! - 参数只会被一个 wait 取走
//!
//! 所有等待都与传入的取消令牌竞争。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::react::events::{EventEmitter, ReactEvent};

/// 审核点类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ToolUseReview,
    Clarification,
    BlueprintReview,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::ToolUseReview => "tool_use_review",
            CheckpointKind::Clarification => "clarification",
            CheckpointKind::BlueprintReview => "blueprint_review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Created,
    Waiting,
    Released,
}

/// 审核响应参数（任意 JSON 对象）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewParams(Map<String, Value>);

impl ReviewParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合成的 continue 响应（自动审核 / YOLO）
    pub fn approve(source: &str) -> Self {
        Self::new()
            .with("suggestion", "continue")
            .with("source", source)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// 非对象的输入（例如纯文本回答）包装为 `{"answer": ...}`
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            Value::String(s) => Self::new().with("answer", s),
            other => Self::new().with("answer", other.to_string()),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// 审核建议：continue / wrong_tool / wrong_params / direct_answer / modify_params / change_blueprint / reject
    pub fn suggestion(&self) -> Option<&str> {
        self.get_str("suggestion")
    }

    pub fn extra_prompt(&self) -> Option<&str> {
        self.get_str("extra_prompt").filter(|s| !s.trim().is_empty())
    }

    /// 澄清问题的回答；按 answer / extra_prompt / suggestion 的顺序取，都没有时返回整个 JSON
    pub fn answer(&self) -> String {
        ["answer", "extra_prompt", "suggestion"]
            .iter()
            .find_map(|k| self.get_str(k).filter(|s| !s.trim().is_empty()))
            .map(String::from)
            .unwrap_or_else(|| self.to_value().to_string())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// 单个审核点
#[derive(Debug)]
pub struct Checkpoint {
    id: String,
    seq: u64,
    task_id: Option<String>,
    kind: CheckpointKind,
    materials: Value,
    created_at: DateTime<Utc>,
    state: Mutex<CheckpointState>,
    release_tx: Mutex<Option<oneshot::Sender<ReviewParams>>>,
    release_rx: Mutex<Option<oneshot::Receiver<ReviewParams>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Checkpoint {
    pub fn new(seq: u64, kind: CheckpointKind, task_id: Option<String>, materials: Value) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            id: format!("cp-{}", uuid::Uuid::new_v4()),
            seq,
            task_id,
            kind,
            materials,
            created_at: Utc::now(),
            state: Mutex::new(CheckpointState::Created),
            release_tx: Mutex::new(Some(tx)),
            release_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    pub fn materials(&self) -> &Value {
        &self.materials
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> CheckpointState {
        *lock(&self.state)
    }

    pub fn is_released(&self) -> bool {
        self.state() == CheckpointState::Released
    }

    /// 释放审核点；只有第一次调用生效
    pub fn release(&self, params: ReviewParams) -> Result<(), AgentError> {
        let tx = lock(&self.release_tx)
            .take()
            .ok_or_else(|| AgentError::CheckpointAlreadyReleased(self.id.clone()))?;
        *lock(&self.state) = CheckpointState::Released;
        // 接收端只会在 wait 取走参数后被丢弃，此时发送端早已被取走
        let _ = tx.send(params);
        Ok(())
    }

    /// 等待释放并取走参数；取消时返回 Cancelled，参数仍留给后续 wait
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<ReviewParams, AgentError> {
        let mut rx = lock(&self.release_rx)
            .take()
            .ok_or_else(|| AgentError::CheckpointAlreadyConsumed(self.id.clone()))?;
        {
            let mut state = lock(&self.state);
            if *state == CheckpointState::Created {
                *state = CheckpointState::Waiting;
            }
        }

        tokio::select! {
            biased;
            received = &mut rx => match received {
                Ok(params) => Ok(params),
                Err(_) => Err(AgentError::Cancelled),
            },
            _ = cancel.cancelled() => {
                *lock(&self.release_rx) = Some(rx);
                Err(AgentError::Cancelled)
            }
        }
    }
}

/// 审核点管理：创建、按 id 释放、清理；创建与释放都会输出事件
pub struct CheckpointManager {
    seq: AtomicU64,
    checkpoints: Mutex<HashMap<String, Arc<Checkpoint>>>,
    emitter: EventEmitter,
}

impl CheckpointManager {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            seq: AtomicU64::new(0),
            checkpoints: Mutex::new(HashMap::new()),
            emitter,
        }
    }

    pub fn create(
        &self,
        kind: CheckpointKind,
        task_id: Option<&str>,
        materials: Value,
    ) -> Arc<Checkpoint> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cp = Arc::new(Checkpoint::new(
            seq,
            kind,
            task_id.map(String::from),
            materials,
        ));
        lock(&self.checkpoints).insert(cp.id().to_string(), cp.clone());
        tracing::info!(checkpoint_id = %cp.id(), kind = ?kind, "Review required");
        self.emitter.emit(ReactEvent::ReviewRequired {
            checkpoint_id: cp.id().to_string(),
            task_id: cp.task_id().map(String::from),
            kind,
            materials: cp.materials().clone(),
        });
        cp
    }

    /// 按 id 释放；未知 id 返回 UnknownCheckpoint，重复释放返回 CheckpointAlreadyReleased
    pub fn release(&self, checkpoint_id: &str, params: ReviewParams) -> Result<(), AgentError> {
        let cp = lock(&self.checkpoints)
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        cp.release(params.clone())?;
        tracing::info!(checkpoint_id = %checkpoint_id, "Review released");
        self.emitter.emit(ReactEvent::ReviewReleased {
            checkpoint_id: checkpoint_id.to_string(),
            params: params.to_value(),
        });
        Ok(())
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<Arc<Checkpoint>> {
        lock(&self.checkpoints).get(checkpoint_id).cloned()
    }

    pub fn contains(&self, checkpoint_id: &str) -> bool {
        lock(&self.checkpoints).contains_key(checkpoint_id)
    }

    /// 尚未释放的审核点，按创建顺序
    pub fn pending(&self) -> Vec<Arc<Checkpoint>> {
        let mut list: Vec<_> = lock(&self.checkpoints)
            .values()
            .filter(|cp| !cp.is_released())
            .cloned()
            .collect();
        list.sort_by_key(|cp| cp.seq());
        list
    }

    /// 参数被消费（或等待方放弃）后移除
    pub fn discard(&self, checkpoint_id: &str) {
        lock(&self.checkpoints).remove(checkpoint_id);
    }
}
