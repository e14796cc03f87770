//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! 参数在执行前按 parameters_schema 校验（jsonschema）。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 单次工具调用的上下文：工具自己的取消令牌与部分输出缓冲（区间审核读取）
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    cancel: CancellationToken,
    output: Arc<Mutex<String>>,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            output: Arc::default(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 追加部分输出
    pub fn write(&self, chunk: &str) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(chunk);
    }

    pub fn snapshot(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限制参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；长时间运行的工具应观察 ctx 的取消令牌
    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<String, String>;
}

/// 工具注册表：按名称有序存储；可选的启用列表限制对模型可见的工具
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    enabled: Option<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// 只启用指定的工具（未知名称忽略）
    pub fn set_enabled<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled = Some(names.into_iter().map(Into::into).collect());
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.enabled.as_ref().map_or(true, |set| set.contains(name))
    }

    /// 按名解析（只返回已启用的工具）
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if !self.is_enabled(name) {
            return None;
        }
        self.tools.get(name).cloned()
    }

    /// 已启用工具名（按名称排序）
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .keys()
            .filter(|name| self.is_enabled(name))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tool_names().is_empty()
    }

    /// 返回 (name, description) 列表，用于 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .filter(|(name, _)| self.is_enabled(name))
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }

    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .filter(|(name, _)| self.is_enabled(name))
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }

    /// 按工具的参数 schema 校验
    pub fn validate(&self, name: &str, params: &Value) -> Result<(), AgentError> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        validate_against_schema(&tool.parameters_schema(), params).map_err(|reason| {
            AgentError::InvalidToolParams {
                tool: name.to_string(),
                reason,
            }
        })
    }
}

/// 用 JSON Schema 校验 value；错误信息以 "; " 拼接
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), String> {
    let compiled =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid schema: {e}"))?;
    if compiled.is_valid(value) {
        return Ok(());
    }
    let messages = compiled
        .iter_errors(value)
        .map(|e| e.to_string())
        .collect::<Vec<_>>();
    Err(messages.join("; "))
}
