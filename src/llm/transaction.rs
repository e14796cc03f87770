//! AI 事务：带重试的一次模型调用
//!
//! 传输失败与回复校验失败（handler 返回 Err）都会用同一个 prompt 重试，直到上限；
//! 只有 handler 返回 Ok 的那一次结果会被交给调用方，之前的尝试不产生任何副作用。
//! 每次调用都与取消令牌竞争。

use std::fmt::Display;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};

#[derive(Clone)]
pub struct AiTransaction {
    llm: Arc<dyn LlmClient>,
    max_attempts: usize,
}

impl AiTransaction {
    pub fn new(llm: Arc<dyn LlmClient>, max_attempts: usize) -> Self {
        Self {
            llm,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 调用模型并用 handler 校验 / 解析回复
    pub async fn call<T, E, F>(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        mut handler: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(&str) -> Result<T, E> + Send,
        E: Display,
    {
        let messages = [Message::user(prompt)];
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.llm.complete(&messages) => reply,
            };

            match reply {
                Ok(text) => match handler(&text) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::warn!(
                            attempt,
                            max = self.max_attempts,
                            "AI transaction rejected response: {}",
                            e
                        );
                        last_error = e.to_string();
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = self.max_attempts,
                        "AI transaction call failed: {}",
                        e
                    );
                    last_error = e;
                }
            }
        }

        Err(AgentError::TransactionExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
