//! 动态上下文与专注模式
//!
//! ContextProvider 在每轮主循环为 prompt 提供一段文本（失败时记录日志并跳过）；
//! FocusMode 按名称限制可选动作并附加提示。

use async_trait::async_trait;

use crate::core::task::Task;
use crate::react::action::ActionSet;

/// 动态上下文提供者
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn provide(&self, task: &Task) -> Result<String, String>;
}

/// 专注模式：限制动作集合并附加 prompt 提示
#[derive(Debug, Clone)]
pub struct FocusMode {
    pub name: String,
    /// None 表示不限制
    pub allowed: Option<ActionSet>,
    pub prompt_hint: Option<String>,
}

impl FocusMode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: None,
            prompt_hint: None,
        }
    }

    pub fn allow(mut self, actions: ActionSet) -> Self {
        self.allowed = Some(actions);
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.prompt_hint = Some(hint.into());
        self
    }

    /// 与本模式取交集
    pub fn restrict(&self, actions: &ActionSet) -> ActionSet {
        match &self.allowed {
            Some(allowed) => actions.intersection(allowed).copied().collect(),
            None => actions.clone(),
        }
    }
}

/// 依次收集各 provider 的输出；失败的 provider 被跳过
pub async fn collect(providers: &[std::sync::Arc<dyn ContextProvider>], task: &Task) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(providers.len());
    for provider in providers {
        match provider.provide(task).await {
            Ok(text) => out.push((provider.name().to_string(), text)),
            Err(e) => {
                tracing::warn!(task_id = %task.id(), provider = provider.name(), "Context provider failed: {}", e)
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::react::action::{all_actions, ActionType};

    struct Fixed(&'static str, Result<&'static str, &'static str>);

    #[async_trait]
    impl ContextProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn provide(&self, _: &Task) -> Result<String, String> {
            self.1.map(String::from).map_err(String::from)
        }
    }

    #[tokio::test]
    async fn test_failing_provider_is_skipped() {
        let task = Task::new("x", &CancellationToken::new());
        let providers: Vec<Arc<dyn ContextProvider>> =
            vec![Arc::new(Fixed("a", Ok("1"))), Arc::new(Fixed("b", Err("boom")))];
        let out = collect(&providers, &task).await;
        assert_eq!(out, vec![("a".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_focus_mode_restricts() {
        let mode = FocusMode::new("answer-only").allow([ActionType::DirectlyAnswer].into_iter().collect());
        let restricted = mode.restrict(&all_actions());
        assert_eq!(restricted.len(), 1);
        assert!(FocusMode::new("open").restrict(&all_actions()).len() == 5);
    }
}
