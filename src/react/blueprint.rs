//! 蓝图（Blueprint / Forge）：具名、带参数 schema 的嵌套执行模板
//!
//! 流程：解析蓝图 -> 生成参数 -> 审核（continue / modify_params / change_blueprint / reject）；
//! 审核通过后交给异步移交控制器，与计划执行相同。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::task::Task;
use crate::core::AgentError;
use crate::react::action::parse_json_object;
use crate::react::loop_::ReactRuntime;
use crate::react::prompt;
use crate::review::{CheckpointKind, ReviewParams};
use crate::tools::validate_against_schema;

#[derive(Debug, Clone, Serialize)]
pub struct Blueprint {
    pub name: String,
    pub description: String,
    pub params_schema: Value,
}

impl Blueprint {
    pub fn new(name: impl Into<String>, description: impl Into<String>, params_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params_schema,
        }
    }
}

/// 蓝图目录
pub trait BlueprintCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<Blueprint>;

    fn list(&self) -> Vec<Blueprint>;
}

/// 固定的蓝图目录
#[derive(Debug, Default)]
pub struct StaticBlueprintCatalog {
    blueprints: BTreeMap<String, Blueprint>,
}

impl StaticBlueprintCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, blueprint: Blueprint) -> Self {
        self.blueprints.insert(blueprint.name.clone(), blueprint);
        self
    }
}

impl BlueprintCatalog for StaticBlueprintCatalog {
    fn get(&self, name: &str) -> Option<Blueprint> {
        self.blueprints.get(name).cloned()
    }

    fn list(&self) -> Vec<Blueprint> {
        self.blueprints.values().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForgeOutcome {
    Approved { blueprint: String, params: Value },
    Rejected,
    Failed(String),
}

/// 蓝图参数生成与审核
pub async fn run_forge(
    rt: &ReactRuntime,
    task: &Task,
    catalog: &dyn BlueprintCatalog,
    blueprint: &str,
    request: Option<&str>,
) -> Result<ForgeOutcome, AgentError> {
    let mut name = blueprint.to_string();
    let mut hint: Option<String> = None;
    let max_rounds = rt.config.tool_param_retry + rt.config.tool_reselect_retry;

    for _ in 0..max_rounds.max(1) {
        let Some(bp) = catalog.get(&name) else {
            return Ok(ForgeOutcome::Failed(format!("unknown blueprint `{name}`")));
        };
        let params = match generate_params(rt, task, &bp, request, hint.take()).await {
            Ok(params) => params,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Ok(ForgeOutcome::Failed(e.to_string())),
        };

        let materials = json!({
            "input": task.input(),
            "blueprint": bp.name,
            "description": bp.description,
            "request": request,
            "params": params,
        });
        let review = rt
            .reviewer
            .review(CheckpointKind::BlueprintReview, task, materials)
            .await?;

        match review.suggestion().unwrap_or("continue") {
            "continue" => {
                return Ok(ForgeOutcome::Approved {
                    blueprint: bp.name,
                    params,
                })
            }
            "modify_params" => match reviewed_params(&review) {
                // 审核方直接给出参数：校验通过即视为批准
                Some(edited) => match validate_against_schema(&bp.params_schema, &edited) {
                    Ok(()) => {
                        return Ok(ForgeOutcome::Approved {
                            blueprint: bp.name,
                            params: edited,
                        })
                    }
                    Err(e) => hint = Some(format!("reviewer params invalid: {e}")),
                },
                None => {
                    hint = Some(
                        review
                            .extra_prompt()
                            .unwrap_or("reviewer asked to modify the parameters")
                            .to_string(),
                    )
                }
            },
            "change_blueprint" => {
                let Some(next) = review.get_str("blueprint") else {
                    return Ok(ForgeOutcome::Failed("change_blueprint without `blueprint`".into()));
                };
                tracing::info!(task_id = %task.id(), from = %name, to = next, "Blueprint changed by review");
                name = next.to_string();
            }
            "reject" => return Ok(ForgeOutcome::Rejected),
            other => {
                tracing::warn!(task_id = %task.id(), suggestion = other, "Unknown review suggestion, treating as reject");
                return Ok(ForgeOutcome::Rejected);
            }
        }
    }
    Ok(ForgeOutcome::Failed(format!(
        "blueprint `{name}` not approved after {max_rounds} review rounds"
    )))
}

fn reviewed_params(review: &ReviewParams) -> Option<Value> {
    match review.to_value().get("params") {
        Some(v @ Value::Object(_)) => Some(v.clone()),
        _ => None,
    }
}

async fn generate_params(
    rt: &ReactRuntime,
    task: &Task,
    bp: &Blueprint,
    request: Option<&str>,
    mut hint: Option<String>,
) -> Result<Value, AgentError> {
    let schema = serde_json::to_string_pretty(&bp.params_schema).unwrap_or_default();
    let mut last = String::new();
    for _ in 0..rt.config.tool_param_retry.max(1) {
        let p = prompt::blueprint_params(
            task.input(),
            &bp.name,
            &bp.description,
            &schema,
            request,
            hint.as_deref(),
        );
        let params = rt
            .tx
            .call(&p, task.cancel_token(), |raw| {
                let mut obj = parse_json_object(raw).map_err(|e| e.to_string())?;
                match obj.remove("params") {
                    Some(v @ Value::Object(_)) => Ok(v),
                    _ => Err("missing object `params`".to_string()),
                }
            })
            .await?;
        match validate_against_schema(&bp.params_schema, &params) {
            Ok(()) => return Ok(params),
            Err(e) => {
                last = e.clone();
                hint = Some(e);
            }
        }
    }
    Err(AgentError::InvalidToolParams {
        tool: bp.name.clone(),
        reason: last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog() {
        let catalog = StaticBlueprintCatalog::new()
            .with(Blueprint::new("b", "second", json!({"type": "object"})))
            .with(Blueprint::new("a", "first", json!({"type": "object"})));
        assert_eq!(catalog.get("a").map(|b| b.description), Some("first".into()));
        assert!(catalog.get("c").is_none());
        let names: Vec<_> = catalog.list().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_reviewed_params() {
        let review = ReviewParams::new()
            .with("suggestion", "modify_params")
            .with("params", json!({"topic": "rust"}));
        assert_eq!(reviewed_params(&review), Some(json!({"topic": "rust"})));
        assert_eq!(reviewed_params(&ReviewParams::new().with("params", "x")), None);
    }
}
