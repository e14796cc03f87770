//! Action：一次模型回复解析出的决策
//!
//! 回复格式（JSON，可包在 ```json 代码块中）：
//! `{"@action":"object","human_readable_thought":"...","cumulative_summary":"...","next_action":{"type":"directly_answer","answer_payload":"..."}}`
//!
//! `next_action.type` 是判别字段：缺失、未知或不在当前允许集合内都是解析失败，由 AI 事务重试。

use std::collections::BTreeSet;
use std::fmt;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ActionParseError;

/// 动作类型（判别字段取值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    DirectlyAnswer,
    RequireTool,
    RequestPlanAndExecution,
    AskForClarification,
    RequireAiBlueprint,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::DirectlyAnswer,
        ActionType::RequireTool,
        ActionType::RequestPlanAndExecution,
        ActionType::AskForClarification,
        ActionType::RequireAiBlueprint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::DirectlyAnswer => "directly_answer",
            ActionType::RequireTool => "require_tool",
            ActionType::RequestPlanAndExecution => "request_plan_and_execution",
            ActionType::AskForClarification => "ask_for_clarification",
            ActionType::RequireAiBlueprint => "require_ai_blueprint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// 需要嵌套执行的动作
    pub fn is_nested(&self) -> bool {
        matches!(
            self,
            ActionType::RequestPlanAndExecution | ActionType::RequireAiBlueprint
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本轮允许的动作集合
pub type ActionSet = BTreeSet<ActionType>;

pub fn all_actions() -> ActionSet {
    ActionType::ALL.into_iter().collect()
}

/// 澄清问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClarificationPayload {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// `next_action` 的线上格式
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NextAction {
    DirectlyAnswer {
        answer_payload: String,
    },
    RequireTool {
        /// 工具名或对所需工具的描述
        tool_require_payload: String,
        /// 中间步骤：执行后不做满意度校验
        #[serde(default)]
        middle_step: bool,
    },
    RequestPlanAndExecution {
        plan_request_payload: String,
    },
    AskForClarification {
        ask_for_clarification_payload: ClarificationPayload,
    },
    RequireAiBlueprint {
        blueprint_payload: String,
        #[serde(default)]
        blueprint_request: Option<String>,
    },
}

/// 主循环回复信封（仅用于生成 prompt 中的 JSON Schema）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ActionEnvelope {
    #[schemars(rename = "@action")]
    action: String,
    /// 本轮思考，必填且不能为空
    human_readable_thought: String,
    /// 对整个任务进展的累计摘要
    cumulative_summary: Option<String>,
    next_action: NextAction,
}

/// 主循环回复的 JSON Schema，拼入 prompt
pub fn action_schema_json() -> String {
    let schema = schema_for!(ActionEnvelope);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解析后的动作（恰好一个变体）
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    DirectlyAnswer {
        answer: String,
    },
    RequireTool {
        tool: String,
        middle_step: bool,
    },
    RequestPlanExecution {
        plan: String,
    },
    AskForClarification {
        question: String,
        options: Vec<String>,
    },
    RequireBlueprintForge {
        blueprint: String,
        request: Option<String>,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::DirectlyAnswer { .. } => ActionType::DirectlyAnswer,
            ActionKind::RequireTool { .. } => ActionType::RequireTool,
            ActionKind::RequestPlanExecution { .. } => ActionType::RequestPlanAndExecution,
            ActionKind::AskForClarification { .. } => ActionType::AskForClarification,
            ActionKind::RequireBlueprintForge { .. } => ActionType::RequireAiBlueprint,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub thought: String,
    pub cumulative_summary: Option<String>,
    pub kind: ActionKind,
}

/// 从模型输出中取出 JSON 对象文本（```json 代码块优先，否则取首个 `{` 到最后一个 `}`）
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(body.trim());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析为 JSON 对象
pub fn parse_json_object(raw: &str) -> Result<serde_json::Map<String, Value>, ActionParseError> {
    let text = extract_json_object(raw).ok_or(ActionParseError::MissingJson)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ActionParseError::MissingJson),
        Err(e) => Err(ActionParseError::InvalidJson(e.to_string())),
    }
}

/// 把一次模型回复解析为 Action；allowed 之外的动作类型视为解析失败
pub fn parse_action(raw: &str, allowed: &ActionSet) -> Result<Action, ActionParseError> {
    let mut obj = parse_json_object(raw)?;

    let thought = obj
        .get("human_readable_thought")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if thought.is_empty() {
        return Err(ActionParseError::EmptyThought);
    }
    let thought = thought.to_string();

    let cumulative_summary = obj
        .get("cumulative_summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let next = obj
        .remove("next_action")
        .ok_or(ActionParseError::MissingDiscriminator)?;
    let type_name = next
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ActionParseError::MissingDiscriminator)?;
    let action_type = ActionType::parse(type_name)
        .ok_or_else(|| ActionParseError::UnknownDiscriminator(type_name.to_string()))?;
    if !allowed.contains(&action_type) {
        return Err(ActionParseError::NotAllowed(type_name.to_string()));
    }

    let payload: NextAction =
        serde_json::from_value(next).map_err(|e| ActionParseError::InvalidPayload {
            action: action_type.to_string(),
            reason: e.to_string(),
        })?;
    let kind = into_kind(payload).map_err(|reason| ActionParseError::InvalidPayload {
        action: action_type.to_string(),
        reason,
    })?;

    Ok(Action {
        thought,
        cumulative_summary,
        kind,
    })
}

fn non_empty(value: String, field: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        Err(format!("`{field}` is empty"))
    } else {
        Ok(value.to_string())
    }
}

fn into_kind(payload: NextAction) -> Result<ActionKind, String> {
    Ok(match payload {
        NextAction::DirectlyAnswer { answer_payload } => ActionKind::DirectlyAnswer {
            answer: non_empty(answer_payload, "answer_payload")?,
        },
        NextAction::RequireTool {
            tool_require_payload,
            middle_step,
        } => ActionKind::RequireTool {
            tool: non_empty(tool_require_payload, "tool_require_payload")?,
            middle_step,
        },
        NextAction::RequestPlanAndExecution {
            plan_request_payload,
        } => ActionKind::RequestPlanExecution {
            plan: non_empty(plan_request_payload, "plan_request_payload")?,
        },
        NextAction::AskForClarification {
            ask_for_clarification_payload: p,
        } => ActionKind::AskForClarification {
            question: non_empty(p.question, "question")?,
            options: p.options,
        },
        NextAction::RequireAiBlueprint {
            blueprint_payload,
            blueprint_request,
        } => ActionKind::RequireBlueprintForge {
            blueprint: non_empty(blueprint_payload, "blueprint_payload")?,
            request: blueprint_request.filter(|r| !r.trim().is_empty()),
        },
    })
}
