//! Mock LLM 客户端（用于测试与本地跑通，无需 API）
//!
//! - MockLlmClient：按 prompt 要求的 `@action` 给出固定形状的回复，主循环一律直接回答（回显用户输入）
//! - ScriptedLlmClient：按顺序返回预置回复，并记录收到的 prompt 与调用次数

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, Message};
use crate::react::prompt;

/// Mock 客户端：回显用户输入
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let prompt_text = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let input = prompt::user_input(prompt_text).unwrap_or("(no input)");

        let reply = match prompt::expected_action(prompt_text) {
            Some(prompt::VERIFY_ACTION) => json!({
                "@action": prompt::VERIFY_ACTION,
                "user_satisfied": true,
                "human_readable_result": format!("Echo from Mock: {input}"),
                "reasoning": "mock",
            }),
            Some(prompt::TOOL_PARAMS_ACTION) => json!({
                "@action": prompt::TOOL_PARAMS_ACTION,
                "params": { "text": input },
            }),
            Some(prompt::RISK_ACTION) => json!({
                "@action": prompt::RISK_ACTION,
                "risk_score": 0.1,
                "reason": "mock",
            }),
            Some(prompt::WRONG_TOOL_ACTION) => json!({
                "@action": prompt::WRONG_TOOL_ACTION,
                "decision": "abandon",
            }),
            Some(prompt::DIRECT_ANSWER_ACTION) => json!({
                "@action": prompt::DIRECT_ANSWER_ACTION,
                "answer_payload": format!("Echo from Mock: {input}"),
            }),
            Some(prompt::BLUEPRINT_PARAMS_ACTION) => json!({
                "@action": prompt::BLUEPRINT_PARAMS_ACTION,
                "params": {},
            }),
            _ => json!({
                "@action": prompt::LOOP_ACTION,
                "human_readable_thought": "Mock client answers directly",
                "next_action": {
                    "type": "directly_answer",
                    "answer_payload": format!("Echo from Mock: {input}"),
                },
            }),
        };
        Ok(reply.to_string())
    }
}

/// 脚本化客户端：依次返回预置回复；耗尽后返回 fallback（未设置则报错）
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// 追加一次传输层失败
    pub fn push_error(&self, error: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error.into()));
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(reply.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(last) = messages.last() {
            self.prompts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(last.content.clone());
        }
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| "scripted replies exhausted".to_string()),
        }
    }
}
