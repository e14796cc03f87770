//! Prompt 构造
//!
//! 每个 prompt 都有 `## User Input` 段，并以 `Reply with a JSON object whose "@action" is "..."` 结尾，
//! 回复的 `@action` 标明用途；Mock 客户端据此给出对应形状的回复。

use std::fmt::Write as _;

use schemars::{schema_for, JsonSchema};

use crate::react::action::{action_schema_json, ActionSet};

pub const LOOP_ACTION: &str = "object";
pub const VERIFY_ACTION: &str = "verify-satisfaction";
pub const TOOL_PARAMS_ACTION: &str = "call-tool";
pub const RISK_ACTION: &str = "risk-score";
pub const WRONG_TOOL_ACTION: &str = "wrong-tool";
pub const DIRECT_ANSWER_ACTION: &str = "directly-answer";
pub const BLUEPRINT_PARAMS_ACTION: &str = "blueprint-params";

const REPLY_PREFIX: &str = "Reply with a JSON object whose \"@action\" is \"";
const USER_INPUT_HEADER: &str = "## User Input\n";

/// prompt 要求的 `@action`
pub fn expected_action(prompt: &str) -> Option<&str> {
    let line = prompt.lines().rev().find(|l| l.starts_with(REPLY_PREFIX))?;
    let rest = &line[REPLY_PREFIX.len()..];
    rest.find('"').map(|end| &rest[..end])
}

/// prompt 中的用户输入段
pub fn user_input(prompt: &str) -> Option<&str> {
    let start = prompt.find(USER_INPUT_HEADER)? + USER_INPUT_HEADER.len();
    let rest = &prompt[start..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// 类型的 JSON Schema（美化输出）
pub fn schema_of<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

fn section(out: &mut String, title: &str, body: &str) {
    let body = body.trim();
    if !body.is_empty() {
        let _ = write!(out, "## {title}\n{body}\n\n");
    }
}

fn finish(mut out: String, input: &str, action: &str) -> String {
    let _ = write!(
        out,
        "{USER_INPUT_HEADER}{}\n\n## Reply\n{REPLY_PREFIX}{action}\".",
        input.trim()
    );
    out
}

/// 主循环 prompt 的组成部分
#[derive(Debug, Default)]
pub struct LoopPrompt<'a> {
    pub input: &'a str,
    pub language: &'a str,
    pub iteration: usize,
    pub max_iterations: usize,
    pub tools: &'a [(String, String)],
    pub blueprints: &'a [(String, String)],
    pub timeline: &'a str,
    pub dynamic_context: &'a [(String, String)],
    pub focus_hint: Option<&'a str>,
    pub allowed: Option<&'a ActionSet>,
}

pub fn main_loop(p: &LoopPrompt<'_>) -> String {
    let mut out = String::from(
        "You are an autonomous agent. Think about the user's request, then choose exactly one next action.\n\n",
    );
    let _ = write!(
        out,
        "Iteration {}/{}. Respond in language: {}.\n\n",
        p.iteration, p.max_iterations, p.language
    );
    if let Some(hint) = p.focus_hint {
        section(&mut out, "Focus", hint);
    }
    if let Some(allowed) = p.allowed {
        let names: Vec<&str> = allowed.iter().map(|a| a.as_str()).collect();
        section(&mut out, "Allowed Actions", &names.join(", "));
    }
    let tools: Vec<String> = p
        .tools
        .iter()
        .map(|(name, desc)| format!("- {name}: {desc}"))
        .collect();
    section(&mut out, "Available Tools", &tools.join("\n"));
    let blueprints: Vec<String> = p
        .blueprints
        .iter()
        .map(|(name, desc)| format!("- {name}: {desc}"))
        .collect();
    section(&mut out, "Available Blueprints", &blueprints.join("\n"));
    for (name, text) in p.dynamic_context {
        section(&mut out, &format!("Context: {name}"), text);
    }
    section(&mut out, "Timeline", p.timeline);
    section(&mut out, "Response Schema", &action_schema_json());
    finish(out, p.input, LOOP_ACTION)
}

/// 生成工具参数；hint 为上一轮校验错误或审核意见
pub fn tool_params(
    input: &str,
    tool: &str,
    description: &str,
    schema: &str,
    timeline: &str,
    hint: Option<&str>,
) -> String {
    let mut out = format!("Generate the call parameters for tool `{tool}`: {description}\n\n");
    section(&mut out, "Parameters Schema", schema);
    section(&mut out, "Timeline", timeline);
    if let Some(hint) = hint {
        section(&mut out, "Previous Attempt Problem", hint);
    }
    section(
        &mut out,
        "Reply Format",
        &format!("{{\"@action\":\"{TOOL_PARAMS_ACTION}\",\"params\":{{...}}}}"),
    );
    finish(out, input, TOOL_PARAMS_ACTION)
}

/// 工具调用后的满意度校验
pub fn verify(input: &str, tool: &str, output: &str, timeline: &str, reply_schema: &str) -> String {
    let mut out = String::from(
        "A tool was just executed for the user. Decide whether the user's need is now satisfied.\n\n",
    );
    section(&mut out, &format!("Tool `{tool}` Output"), output);
    section(&mut out, "Timeline", timeline);
    section(&mut out, "Reply Schema", reply_schema);
    finish(out, input, VERIFY_ACTION)
}

/// 请求的工具无法解析，或审核认为选错了工具
pub fn wrong_tool(input: &str, requested: &str, tools: &[String], hint: Option<&str>) -> String {
    let mut out = format!(
        "The requested tool `{requested}` cannot be used. Pick another tool from the list, ask the user first, or abandon tool use.\n\n"
    );
    section(&mut out, "Available Tools", &tools.join(", "));
    if let Some(hint) = hint {
        section(&mut out, "Reviewer Note", hint);
    }
    section(
        &mut out,
        "Reply Format",
        &format!(
            "{{\"@action\":\"{WRONG_TOOL_ACTION}\",\"decision\":\"reselect|ask_user|abandon\",\"tool\":\"<name when reselect>\",\"question\":\"<question when ask_user>\"}}"
        ),
    );
    finish(out, input, WRONG_TOOL_ACTION)
}

/// 放弃工具，直接回答
pub fn direct_answer(input: &str, timeline: &str, reason: &str) -> String {
    let mut out = String::from("Answer the user directly without using any tool.\n\n");
    section(&mut out, "Why", reason);
    section(&mut out, "Timeline", timeline);
    section(
        &mut out,
        "Reply Format",
        &format!("{{\"@action\":\"{DIRECT_ANSWER_ACTION}\",\"answer_payload\":\"...\"}}"),
    );
    finish(out, input, DIRECT_ANSWER_ACTION)
}

/// 生成蓝图调用参数
pub fn blueprint_params(
    input: &str,
    blueprint: &str,
    description: &str,
    schema: &str,
    request: Option<&str>,
    hint: Option<&str>,
) -> String {
    let mut out = format!("Generate the parameters to run blueprint `{blueprint}`: {description}\n\n");
    section(&mut out, "Parameters Schema", schema);
    if let Some(request) = request {
        section(&mut out, "Request", request);
    }
    if let Some(hint) = hint {
        section(&mut out, "Previous Attempt Problem", hint);
    }
    section(
        &mut out,
        "Reply Format",
        &format!("{{\"@action\":\"{BLUEPRINT_PARAMS_ACTION}\",\"params\":{{...}}}}"),
    );
    finish(out, input, BLUEPRINT_PARAMS_ACTION)
}

/// 风险评分
pub fn risk_score(input: &str, kind: &str, materials: &str) -> String {
    let mut out = String::from(
        "Score the risk of letting the pending step run without a human looking at it, from 0.0 (harmless) to 1.0 (dangerous).\n\n",
    );
    section(&mut out, &format!("Pending {kind}"), materials);
    section(
        &mut out,
        "Reply Format",
        &format!("{{\"@action\":\"{RISK_ACTION}\",\"risk_score\":0.0,\"reason\":\"...\"}}"),
    );
    finish(out, input, RISK_ACTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_prompt_declares_action_and_input() {
        let prompts = [
            (main_loop(&LoopPrompt { input: "abc", ..Default::default() }), LOOP_ACTION),
            (tool_params("abc", "echo", "d", "{}", "", Some("bad")), TOOL_PARAMS_ACTION),
            (verify("abc", "echo", "out", "", "{}"), VERIFY_ACTION),
            (wrong_tool("abc", "x", &["echo".into()], None), WRONG_TOOL_ACTION),
            (direct_answer("abc", "", "no tool"), DIRECT_ANSWER_ACTION),
            (blueprint_params("abc", "bp", "d", "{}", None, None), BLUEPRINT_PARAMS_ACTION),
            (risk_score("abc", "tool", "{}"), RISK_ACTION),
        ];
        for (prompt, action) in prompts {
            assert_eq!(expected_action(&prompt), Some(action));
            assert_eq!(user_input(&prompt), Some("abc"));
        }
    }

    #[test]
    fn test_user_input_stops_at_next_section() {
        let p = "## User Input\nhello\nworld\n## Other\nx";
        assert_eq!(user_input(p), Some("hello\nworld"));
        assert_eq!(user_input("nothing"), None);
        assert_eq!(expected_action("nothing"), None);
    }

    #[test]
    fn test_main_loop_includes_context() {
        let tools = vec![("echo".to_string(), "echo text".to_string())];
        let ctx = vec![("clock".to_string(), "12:00".to_string())];
        let p = main_loop(&LoopPrompt {
            input: "abc",
            language: "zh",
            iteration: 2,
            max_iterations: 5,
            tools: &tools,
            dynamic_context: &ctx,
            focus_hint: Some("be brief"),
            ..Default::default()
        });
        assert!(p.contains("Iteration 2/5"));
        assert!(p.contains("- echo: echo text"));
        assert!(p.contains("## Context: clock\n12:00"));
        assert!(p.contains("## Focus\nbe brief"));
    }
}
