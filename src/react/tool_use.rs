//! 工具调用子流程
//!
//! 解析工具 -> 生成参数（校验失败带错误信息重新生成）-> 审核点 -> 执行。
//! 工具无法解析或审核认为选错工具时进入重新选择；重新选择与参数重生成都有次数上限，
//! 超出后放弃工具，回退为直接回答。
//!
//! 只有取消会以 Err 返回，其余失败都折叠为 ToolUseOutcome。

use serde_json::{json, Value};

use crate::core::task::Task;
use crate::core::AgentError;
use crate::memory::EntryKind;
use crate::react::action::parse_json_object;
use crate::react::events::{preview, ReactEvent};
use crate::react::loop_::ReactRuntime;
use crate::react::prompt;
use crate::review::{CheckpointKind, ReviewPolicy};
use crate::tools::ToolResult;

const OUTPUT_PREVIEW_CHARS: usize = 200;

/// 工具子流程的结局
#[derive(Debug, Clone)]
pub enum ToolUseOutcome {
    Executed(ToolResult),
    /// 参数生成失败、执行失败、超时或被区间审核取消
    Failed(String),
    /// 放弃工具后得到的直接回答
    DirectAnswer(String),
    /// 重新选择阶段先向用户澄清，回答已记入时间线
    Clarified(String),
    /// 审核拒绝
    Rejected,
}

/// 选错工具审核的结论
#[derive(Debug, Clone, PartialEq, Eq)]
enum WrongToolDecision {
    Reselect(String),
    AskUser(String),
    Abandon,
}

pub async fn run_tool_use(
    rt: &ReactRuntime,
    task: &Task,
    requested: &str,
) -> Result<ToolUseOutcome, AgentError> {
    let cfg = &rt.config;
    let mut requested = requested.to_string();
    // Some 表示审核要求换工具（附审核意见）
    let mut reselect_hint: Option<Option<String>> = None;
    let mut param_hint: Option<String> = None;
    let mut reselects = 0usize;
    let mut param_rounds = 0usize;

    loop {
        let resolved = match reselect_hint {
            Some(_) => None,
            None => rt.registry().get(&requested),
        };
        let Some(tool) = resolved else {
            if reselects >= cfg.tool_reselect_retry {
                tracing::warn!(task_id = %task.id(), tool = %requested, "Tool reselection budget exhausted");
                return fallback_direct_answer(rt, task, &format!("tool `{requested}` is not usable")).await;
            }
            reselects += 1;
            let hint = reselect_hint.take().flatten();
            match wrong_tool_review(rt, task, &requested, hint.as_deref()).await {
                Ok(WrongToolDecision::Reselect(name)) => {
                    tracing::info!(task_id = %task.id(), from = %requested, to = %name, "Tool reselected");
                    requested = name;
                    param_hint = None;
                    continue;
                }
                Ok(WrongToolDecision::AskUser(question)) if rt.clarification_available(task) => {
                    let answer = rt.ask_user(task, &question, &[]).await?;
                    return Ok(ToolUseOutcome::Clarified(answer));
                }
                Ok(_) => {
                    return fallback_direct_answer(rt, task, &format!("tool `{requested}` abandoned")).await
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(task_id = %task.id(), "Wrong tool review failed: {}", e);
                    return fallback_direct_answer(rt, task, &format!("tool `{requested}` is not usable")).await;
                }
            }
        };

        let params = match generate_params(rt, task, tool.name(), param_hint.take()).await {
            Ok(params) => params,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Ok(ToolUseOutcome::Failed(e.to_string())),
        };

        let review = if rt.reviewer.policy() == ReviewPolicy::Yolo {
            None
        } else {
            let materials = json!({
                "input": task.input(),
                "tool": tool.name(),
                "description": tool.description(),
                "params": params,
            });
            Some(rt.reviewer.review(CheckpointKind::ToolUseReview, task, materials).await?)
        };
        let suggestion = review
            .as_ref()
            .and_then(|r| r.suggestion().map(String::from))
            .unwrap_or_else(|| "continue".to_string());
        let extra = review
            .as_ref()
            .and_then(|r| r.extra_prompt().map(String::from));

        match suggestion.as_str() {
            "continue" => return execute(rt, task, tool.name(), params).await,
            "wrong_tool" => {
                reselect_hint = Some(extra);
            }
            "wrong_params" => {
                param_rounds += 1;
                if param_rounds > cfg.tool_param_retry {
                    return Ok(ToolUseOutcome::Failed(format!(
                        "parameters for `{}` rejected by review {} times",
                        tool.name(),
                        param_rounds
                    )));
                }
                param_hint = Some(extra.unwrap_or_else(|| "reviewer rejected the parameters".to_string()));
            }
            "direct_answer" => {
                return fallback_direct_answer(rt, task, extra.as_deref().unwrap_or("reviewer asked for a direct answer")).await;
            }
            "reject" => return Ok(ToolUseOutcome::Rejected),
            other => {
                tracing::warn!(task_id = %task.id(), suggestion = other, "Unknown review suggestion, treating as reject");
                return Ok(ToolUseOutcome::Rejected);
            }
        }
    }
}

/// 生成并校验参数；校验失败时把错误带入下一轮 prompt，最多 tool_param_retry 轮
async fn generate_params(
    rt: &ReactRuntime,
    task: &Task,
    tool_name: &str,
    mut hint: Option<String>,
) -> Result<Value, AgentError> {
    let registry = rt.registry();
    let tool = registry
        .get(tool_name)
        .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;
    let schema = serde_json::to_string_pretty(&tool.parameters_schema()).unwrap_or_default();
    let mut last = String::new();

    for round in 1..=rt.config.tool_param_retry.max(1) {
        let p = prompt::tool_params(
            task.input(),
            tool_name,
            tool.description(),
            &schema,
            &rt.timeline().dump(),
            hint.as_deref(),
        );
        let params = rt
            .tx
            .call(&p, task.cancel_token(), |raw| {
                let mut obj = parse_json_object(raw).map_err(|e| e.to_string())?;
                match obj.remove("params") {
                    Some(Value::Object(map)) => Ok(Value::Object(map)),
                    Some(_) => Err("`params` must be an object".to_string()),
                    None => Err("missing `params`".to_string()),
                }
            })
            .await?;
        match registry.validate(tool_name, &params) {
            Ok(()) => return Ok(params),
            Err(e) => {
                tracing::warn!(task_id = %task.id(), tool = tool_name, round, "Tool params invalid: {}", e);
                last = e.to_string();
                hint = Some(last.clone());
            }
        }
    }
    Err(AgentError::InvalidToolParams {
        tool: tool_name.to_string(),
        reason: last,
    })
}

async fn wrong_tool_review(
    rt: &ReactRuntime,
    task: &Task,
    requested: &str,
    hint: Option<&str>,
) -> Result<WrongToolDecision, AgentError> {
    let registry = rt.registry();
    let names = registry.tool_names();
    let p = prompt::wrong_tool(task.input(), requested, &names, hint);
    rt.tx
        .call(&p, task.cancel_token(), |raw| {
            let obj = parse_json_object(raw).map_err(|e| e.to_string())?;
            let field = |key: &str| {
                obj.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            };
            match field("decision") {
                Some("reselect") => {
                    let name = field("tool").ok_or("reselect without `tool`")?;
                    if registry.get(name).is_none() {
                        return Err(format!("unknown tool `{name}`"));
                    }
                    Ok(WrongToolDecision::Reselect(name.to_string()))
                }
                Some("ask_user") => {
                    let question = field("question").ok_or("ask_user without `question`")?;
                    Ok(WrongToolDecision::AskUser(question.to_string()))
                }
                Some("abandon") => Ok(WrongToolDecision::Abandon),
                Some(other) => Err(format!("unknown decision `{other}`")),
                None => Err("missing `decision`".to_string()),
            }
        })
        .await
}

/// 放弃工具，请模型直接回答
pub(crate) async fn fallback_direct_answer(
    rt: &ReactRuntime,
    task: &Task,
    reason: &str,
) -> Result<ToolUseOutcome, AgentError> {
    let p = prompt::direct_answer(task.input(), &rt.timeline().dump(), reason);
    let answer = rt
        .tx
        .call(&p, task.cancel_token(), |raw| {
            let obj = parse_json_object(raw).map_err(|e| e.to_string())?;
            obj.get("answer_payload")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .ok_or_else(|| "missing `answer_payload`".to_string())
        })
        .await;
    match answer {
        Ok(answer) => Ok(ToolUseOutcome::DirectAnswer(answer)),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => Ok(ToolUseOutcome::Failed(format!("direct answer fallback failed: {e}"))),
    }
}

async fn execute(
    rt: &ReactRuntime,
    task: &Task,
    tool: &str,
    params: Value,
) -> Result<ToolUseOutcome, AgentError> {
    rt.emitter.emit(ReactEvent::ToolCallStart {
        task_id: task.id().to_string(),
        tool: tool.to_string(),
        params: params.clone(),
    });
    match rt.executor.execute(tool, params, task.cancel_token()).await {
        Ok(result) => {
            rt.emitter.emit(ReactEvent::ToolCallDone {
                task_id: task.id().to_string(),
                tool: tool.to_string(),
                preview: preview(&result.output, OUTPUT_PREVIEW_CHARS),
                duration_ms: result.duration_ms,
            });
            rt.timeline().add(
                Some(task.id()),
                EntryKind::ToolResult,
                format!("{tool}: {}", result.output),
            );
            Ok(ToolUseOutcome::Executed(result))
        }
        Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
        Err(e) => {
            rt.emitter.emit(ReactEvent::ToolCallFailed {
                task_id: task.id().to_string(),
                tool: tool.to_string(),
                reason: e.to_string(),
            });
            Ok(ToolUseOutcome::Failed(e.to_string()))
        }
    }
}
