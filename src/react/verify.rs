//! 工具调用后的满意度校验
//!
//! 校验事务在后台任务中运行，主循环只等待它的结论（并与任务取消竞争）。
//! `human_readable_result` 为空的回复视为格式错误，由事务包装器重试。

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::AiTransaction;
use crate::react::action::parse_json_object;
use crate::react::prompt;

/// 校验回复格式
#[allow(dead_code)]
#[derive(Debug, Deserialize, JsonSchema)]
pub struct VerifyReply {
    #[serde(rename = "@action", default)]
    action: Option<String>,
    pub user_satisfied: bool,
    pub human_readable_result: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub satisfied: bool,
    pub result: String,
    pub reasoning: String,
}

pub fn parse_verdict(raw: &str) -> Result<Verdict, String> {
    let obj = parse_json_object(raw).map_err(|e| e.to_string())?;
    let reply: VerifyReply =
        serde_json::from_value(serde_json::Value::Object(obj)).map_err(|e| e.to_string())?;
    let result = reply.human_readable_result.trim();
    if result.is_empty() {
        return Err("empty `human_readable_result`".to_string());
    }
    Ok(Verdict {
        satisfied: reply.user_satisfied,
        result: result.to_string(),
        reasoning: reply.reasoning,
    })
}

/// 在后台运行校验事务，等待结论或取消
pub async fn verify_satisfaction(
    tx: &AiTransaction,
    input: &str,
    tool: &str,
    output: &str,
    timeline: &str,
    cancel: &CancellationToken,
) -> Result<Verdict, AgentError> {
    let prompt = prompt::verify(
        input,
        tool,
        output,
        timeline,
        &prompt::schema_of::<VerifyReply>(),
    );
    let tx = tx.clone();
    let scope = cancel.child_token();
    let handle = {
        let scope = scope.clone();
        tokio::spawn(async move { tx.call(&prompt, &scope, parse_verdict).await })
    };
    let abort = handle.abort_handle();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            scope.cancel();
            abort.abort();
            Err(AgentError::Cancelled)
        }
        joined = handle => match joined {
            Ok(result) => result,
            Err(e) => Err(AgentError::LlmError(format!("verification task failed: {e}"))),
        },
    }
}
