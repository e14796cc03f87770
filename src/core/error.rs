//! 运行时错误类型
//!
//! AgentError 覆盖入队拒绝、AI 事务耗尽、取消、状态机非法迁移、审核点、工具与嵌套执行；
//! ActionParseError 仅描述一次模型回复无法解析为 Action 的原因，由 AI 事务包装器重试。

use thiserror::Error;

use crate::core::task::TaskStatus;

/// 运行时错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 入队 hook 返回错误（否决但不报错的情况不走这里）
    #[error("Enqueue rejected by hook '{hook}': {reason}")]
    EnqueueRejected { hook: String, reason: String },

    #[error("AI transaction failed after {attempts} attempts: {last_error}")]
    TransactionExhausted { attempts: usize, last_error: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Illegal task status transition: {from:?} -> {to:?}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Checkpoint already released: {0}")]
    CheckpointAlreadyReleased(String),

    /// 同一审核点的参数只能被一个等待者取走
    #[error("Checkpoint already consumed: {0}")]
    CheckpointAlreadyConsumed(String),

    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool params for '{tool}': {reason}")]
    InvalidToolParams { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 工具自身的取消令牌被触发（区间审核或任务取消）
    #[error("Tool cancelled: {0}")]
    ToolCancelled(String),

    #[error("Nested execution failed: {0}")]
    NestedExecutionFailed(String),

    /// 已有嵌套执行在运行，不允许再嵌套
    #[error("Nested execution already active for task {0}")]
    NestedExecutionActive(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled | AgentError::ToolCancelled(_))
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Persistence(format!("{e:#}"))
    }
}

/// 模型回复解析失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionParseError {
    #[error("no JSON object found in response")]
    MissingJson,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing action discriminator `next_action.type`")]
    MissingDiscriminator,

    #[error("unknown action type `{0}`")]
    UnknownDiscriminator(String),

    #[error("action `{0}` is not allowed in the current context")]
    NotAllowed(String),

    #[error("missing or empty `human_readable_thought`")]
    EmptyThought,

    #[error("invalid payload for `{action}`: {reason}")]
    InvalidPayload { action: String, reason: String },
}
