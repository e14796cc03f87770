//! 集成测试共用：回复构造、按输入路由的 LLM、测试工具、事件等待

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bee_react::config::AgentConfig;
use bee_react::core::task::TaskSnapshot;
use bee_react::llm::{LlmClient, Message};
use bee_react::react::prompt;
use bee_react::review::ReviewPolicy;
use bee_react::tools::{Tool, ToolContext};
use bee_react::{Agent, ReactEvent};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(policy: ReviewPolicy) -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.review.policy = policy;
    cfg.max_iterations = 10;
    cfg.ai_transaction_retry = 2;
    cfg
}

fn loop_reply(next: Value) -> String {
    json!({
        "@action": prompt::LOOP_ACTION,
        "human_readable_thought": "thinking",
        "next_action": next,
    })
    .to_string()
}

pub fn answer(text: &str) -> String {
    loop_reply(json!({ "type": "directly_answer", "answer_payload": text }))
}

pub fn use_tool(tool: &str, middle_step: bool) -> String {
    loop_reply(json!({
        "type": "require_tool",
        "tool_require_payload": tool,
        "middle_step": middle_step,
    }))
}

pub fn plan(payload: &str) -> String {
    loop_reply(json!({ "type": "request_plan_and_execution", "plan_request_payload": payload }))
}

pub fn ask(question: &str) -> String {
    loop_reply(json!({
        "type": "ask_for_clarification",
        "ask_for_clarification_payload": { "question": question, "options": [] },
    }))
}

pub fn blueprint(name: &str) -> String {
    loop_reply(json!({ "type": "require_ai_blueprint", "blueprint_payload": name }))
}

pub fn params(params: Value) -> String {
    json!({ "@action": prompt::TOOL_PARAMS_ACTION, "params": params }).to_string()
}

pub fn verdict(satisfied: bool, result: &str) -> String {
    json!({
        "@action": prompt::VERIFY_ACTION,
        "user_satisfied": satisfied,
        "human_readable_result": result,
        "reasoning": "checked",
    })
    .to_string()
}

/// 按任务输入决定回复：
/// - `tool:<name> ...`：主循环请求该工具，参数 `{"text": 输入}`，校验通过
/// - 其它输入：直接回答 `done: <输入>`
#[derive(Debug, Default)]
pub struct RoutedLlm;

#[async_trait]
impl LlmClient for RoutedLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let text = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let input = prompt::user_input(text).unwrap_or_default();
        let tool = input
            .strip_prefix("tool:")
            .and_then(|rest| rest.split_whitespace().next());
        let reply = match prompt::expected_action(text) {
            Some(prompt::TOOL_PARAMS_ACTION) => params(json!({ "text": input })),
            Some(prompt::VERIFY_ACTION) => verdict(true, &format!("verified: {input}")),
            Some(prompt::RISK_ACTION) => {
                json!({ "@action": prompt::RISK_ACTION, "risk_score": 0.1 }).to_string()
            }
            _ => match tool {
                Some(tool) => use_tool(tool, false),
                None => answer(&format!("done: {input}")),
            },
        };
        Ok(reply)
    }
}

/// 一直运行直到被取消；记录收到的取消令牌
#[derive(Default)]
pub struct SleepTool {
    pub token: Arc<Mutex<Option<CancellationToken>>>,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps until cancelled"
    }

    async fn execute(&self, _args: Value, ctx: ToolContext) -> Result<String, String> {
        *self.token.lock().unwrap() = Some(ctx.cancel_token().clone());
        ctx.write("sleeping");
        ctx.cancel_token().cancelled().await;
        Err("cancelled".into())
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "boom"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    async fn execute(&self, _args: Value, _ctx: ToolContext) -> Result<String, String> {
        panic!("tool exploded");
    }
}

/// 等到第一个满足条件的事件
pub async fn wait_event<F>(events: &mut UnboundedReceiver<ReactEvent>, mut pred: F) -> ReactEvent
where
    F: FnMut(&ReactEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// 等待审核点出现并返回其 id
pub async fn wait_checkpoint(events: &mut UnboundedReceiver<ReactEvent>) -> String {
    match wait_event(events, |e| matches!(e, ReactEvent::ReviewRequired { .. })).await {
        ReactEvent::ReviewRequired { checkpoint_id, .. } => checkpoint_id,
        _ => unreachable!(),
    }
}

pub async fn finished(agent: &Agent, task_id: &str) -> TaskSnapshot {
    tokio::time::timeout(WAIT, agent.wait_for_task(task_id))
        .await
        .expect("task did not finish")
        .expect("unknown task")
}
