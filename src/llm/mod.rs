//! LLM 层：客户端抽象、实现（OpenAI 兼容 / Mock）与带重试的 AI 事务

pub mod mock;
pub mod openai;
pub mod traits;
pub mod transaction;

use std::sync::Arc;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};
pub use transaction::AiTransaction;

use crate::config::LlmSection;

/// 按 [llm] 配置创建客户端；provider 未知时退回 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "openai" => {
            let api_key = cfg
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok());
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible client");
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, api_key))
        }
        "mock" => Arc::new(MockLlmClient),
        other => {
            tracing::warn!("Unknown LLM provider '{}', falling back to mock", other);
            Arc::new(MockLlmClient)
        }
    }
}
