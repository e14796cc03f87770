//! 主循环集成测试：直接回答、工具调用与校验、迭代预算、澄清、异步移交、会话恢复

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bee_react::core::handoff::{NestedContext, NestedExecutor, NestedRequest};
use bee_react::core::task::{FinishReason, TaskStatus};
use bee_react::core::InputEvent;
use bee_react::llm::ScriptedLlmClient;
use bee_react::memory::{MemoryTimelineStore, TimelineStore};
use bee_react::react::{Blueprint, StaticBlueprintCatalog};
use bee_react::review::ReviewPolicy;
use bee_react::tools::EchoTool;
use bee_react::{Agent, ReactEvent};
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_direct_answer_completes_with_result() {
    let llm = Arc::new(ScriptedLlmClient::new([answer("42")]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .build()
        .await;
    agent.start();

    let id = agent.submit("what is the answer").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Answered));
    assert_eq!(snapshot.result.as_deref(), Some("42"));
    assert_eq!(snapshot.iteration, 1);
    assert_eq!(llm.calls(), 1);

    match wait_event(&mut events, |e| matches!(e, ReactEvent::TaskFinished { .. })).await {
        ReactEvent::TaskFinished { task_id, result, .. } => {
            assert_eq!(task_id, id);
            assert_eq!(result.as_deref(), Some("42"));
        }
        _ => unreachable!(),
    }
    assert!(agent.timeline_dump().contains("[answer] 42"));
}

#[tokio::test]
async fn test_tool_result_verified_as_satisfying() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "hi" })),
        verdict(true, "said hi"),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("say hi").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Satisfied));
    assert_eq!(snapshot.result.as_deref(), Some("said hi"));
    assert_eq!(llm.calls(), 3);

    match wait_event(&mut events, |e| matches!(e, ReactEvent::ToolCallDone { .. })).await {
        ReactEvent::ToolCallDone { tool, preview, .. } => {
            assert_eq!(tool, "echo");
            assert_eq!(preview, "hi");
        }
        _ => unreachable!(),
    }
    // yolo 下不创建审核点
    assert!(agent.checkpoints().is_empty());
}

#[tokio::test]
async fn test_zero_param_retry_still_generates_params_once() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "once" })),
        verdict(true, "said once"),
    ]));
    let mut cfg = config(ReviewPolicy::Yolo);
    cfg.tool_param_retry = 0;
    let (agent, _events) = Agent::builder(cfg, llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("say once").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Satisfied));
    assert_eq!(snapshot.result.as_deref(), Some("said once"));
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn test_middle_step_skips_verification() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", true),
        params(json!({ "text": "step" })),
        answer("final"),
    ]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("two steps").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("final"));
    assert_eq!(snapshot.iteration, 2);
    assert!(!llm
        .prompts()
        .iter()
        .any(|p| bee_react::react::prompt::expected_action(p) == Some(bee_react::react::prompt::VERIFY_ACTION)));
}

#[tokio::test]
async fn test_unsatisfied_verdict_continues_loop() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "partial" })),
        verdict(false, "only part done"),
        answer("complete"),
    ]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("do it").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Answered));
    assert_eq!(snapshot.result.as_deref(), Some("complete"));
    assert_eq!(snapshot.iteration, 2);
}

#[tokio::test]
async fn test_invalid_params_are_regenerated() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "wrong": 1 })),
        params(json!({ "text": "fixed" })),
        verdict(true, "fixed"),
    ]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("echo").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("fixed"));
    // 第二次参数 prompt 带上了校验错误
    let retry_prompt = &llm.prompts()[2];
    assert!(retry_prompt.contains("text"), "{retry_prompt}");
}

#[tokio::test]
async fn test_iteration_budget_exhausted() {
    let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()).with_fallback("not json at all"));
    let mut cfg = config(ReviewPolicy::Yolo);
    cfg.max_iterations = 3;
    cfg.ai_transaction_retry = 1;
    let (agent, mut events) = Agent::builder(cfg, llm.clone()).build().await;
    agent.start();

    let id = agent.submit("never answered").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::IterationBudgetExhausted));
    assert_eq!(snapshot.result, None);
    assert_eq!(snapshot.iteration, 3);
    assert_eq!(llm.calls(), 3);

    // 每轮失败都有 warning
    let mut warnings = 0;
    while warnings < 3 {
        wait_event(&mut events, |e| matches!(e, ReactEvent::Warning { .. })).await;
        warnings += 1;
    }
}

#[tokio::test]
async fn test_transaction_retries_within_one_iteration() {
    let llm = Arc::new(ScriptedLlmClient::new([
        "```json\n{\"@action\":\"object\"}\n```".to_string(),
        answer("second try"),
    ]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .build()
        .await;
    agent.start();

    let id = agent.submit("retry").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("second try"));
    assert_eq!(snapshot.iteration, 1);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_clarification_waits_for_user_answer() {
    let llm = Arc::new(ScriptedLlmClient::new([ask("which color?"), answer("painted blue")]));
    // yolo 不影响澄清：仍要等人回答
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .build()
        .await;
    agent.start();

    let id = agent.submit("paint it").unwrap();
    let checkpoint_id = wait_checkpoint(&mut events).await;
    assert_eq!(agent.task(&id).unwrap().status(), TaskStatus::Processing);

    agent
        .handle_input(InputEvent::InteractiveResponse {
            checkpoint_id,
            params: json!("blue"),
        })
        .await;
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("painted blue"));
    assert!(agent.timeline_dump().contains("A: blue"));
    assert_eq!(agent.task(&id).unwrap().clarification_count(), 1);
}

#[tokio::test]
async fn test_clarification_limit_removes_action() {
    let llm = Arc::new(ScriptedLlmClient::new([ask("again?"), answer("gave up asking")]));
    let mut cfg = config(ReviewPolicy::Yolo);
    cfg.user_interactive_limit = 0;
    cfg.ai_transaction_retry = 2;
    let (agent, _events) = Agent::builder(cfg, llm.clone()).build().await;
    agent.start();

    let id = agent.submit("no questions").unwrap();
    let snapshot = finished(&agent, &id).await;
    // 提问不在允许集合内，视为解析失败并在同一事务里重试
    assert_eq!(snapshot.result.as_deref(), Some("gave up asking"));
    assert_eq!(snapshot.iteration, 1);
}

#[tokio::test]
async fn test_unknown_tool_falls_back_to_direct_answer() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("teleport", false),
        json!({ "@action": "wrong-tool", "decision": "abandon" }).to_string(),
        json!({ "@action": "directly-answer", "answer_payload": "cannot teleport" }).to_string(),
    ]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("teleport me").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Answered));
    assert_eq!(snapshot.result.as_deref(), Some("cannot teleport"));
}

#[tokio::test]
async fn test_review_reject_ends_task_without_result() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "rm -rf" })),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("dangerous").unwrap();
    let checkpoint_id = wait_checkpoint(&mut events).await;
    agent
        .handle_input(InputEvent::InteractiveResponse {
            checkpoint_id,
            params: json!({ "suggestion": "reject" }),
        })
        .await;
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::ReviewRejected));
    assert_eq!(snapshot.result, None);
}

#[tokio::test]
async fn test_wrong_params_review_regenerates() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "first" })),
        params(json!({ "text": "second" })),
        verdict(true, "echoed second"),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("echo something").unwrap();
    let first = wait_checkpoint(&mut events).await;
    agent
        .release_checkpoint(
            &first,
            bee_react::review::ReviewParams::new()
                .with("suggestion", "wrong_params")
                .with("extra_prompt", "say second"),
        )
        .unwrap();
    let second = wait_checkpoint(&mut events).await;
    assert_ne!(first, second);
    agent
        .release_checkpoint(&second, bee_react::review::ReviewParams::approve("human"))
        .unwrap();

    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("echoed second"));
    assert!(llm.prompts()[2].contains("say second"));
}

struct EchoPlan;

#[async_trait]
impl NestedExecutor for EchoPlan {
    async fn execute(&self, request: NestedRequest, ctx: NestedContext) -> Result<String, String> {
        match request {
            NestedRequest::Plan { payload } => Ok(format!("{} -> {}", ctx.input, payload)),
            NestedRequest::Blueprint { name, params } => Ok(format!("{name}: {params}")),
        }
    }
}

#[tokio::test]
async fn test_plan_hands_off_to_nested_execution() {
    let llm = Arc::new(ScriptedLlmClient::new([plan("step 1, step 2")]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .nested_executor(Arc::new(EchoPlan))
        .build()
        .await;
    agent.start();

    let id = agent.submit("big job").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::NestedCompleted));
    assert_eq!(snapshot.result.as_deref(), Some("big job -> step 1, step 2"));
    assert_eq!(snapshot.async_execution, None);

    match wait_event(&mut events, |e| matches!(e, ReactEvent::AsyncFinished { .. })).await {
        ReactEvent::AsyncFinished { task_id, success, .. } => {
            assert_eq!(task_id, id);
            assert!(success);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_plan_not_offered_without_nested_executor() {
    let llm = Arc::new(ScriptedLlmClient::new([plan("step"), answer("did it inline")]));
    let (agent, _events) = Agent::builder(config(ReviewPolicy::Yolo), llm.clone())
        .build()
        .await;
    agent.start();

    let id = agent.submit("big job").unwrap();
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.result.as_deref(), Some("did it inline"));
    let prompt = &llm.prompts()[0];
    let start = prompt.find("## Allowed Actions").unwrap();
    let allowed = &prompt[start..start + prompt[start..].find("\n\n").unwrap()];
    assert!(allowed.contains("directly_answer"));
    assert!(!allowed.contains("request_plan_and_execution"));
}

#[tokio::test]
async fn test_blueprint_forge_hands_off_after_review() {
    let catalog = StaticBlueprintCatalog::new().with(Blueprint::new(
        "report",
        "Writes a report",
        json!({
            "type": "object",
            "properties": { "topic": { "type": "string" } },
            "required": ["topic"]
        }),
    ));
    let llm = Arc::new(ScriptedLlmClient::new([
        blueprint("report"),
        json!({ "@action": "blueprint-params", "params": { "topic": "rust" } }).to_string(),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .blueprints(Arc::new(catalog))
        .nested_executor(Arc::new(EchoPlan))
        .build()
        .await;
    agent.start();

    let id = agent.submit("write a report").unwrap();
    match wait_event(&mut events, |e| matches!(e, ReactEvent::ReviewRequired { .. })).await {
        ReactEvent::ReviewRequired { checkpoint_id, kind, .. } => {
            assert_eq!(kind, bee_react::review::CheckpointKind::BlueprintReview);
            agent
                .release_checkpoint(&checkpoint_id, bee_react::review::ReviewParams::approve("human"))
                .unwrap();
        }
        _ => unreachable!(),
    }
    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.finish_reason, Some(FinishReason::NestedCompleted));
    assert_eq!(snapshot.result.as_deref(), Some(r#"report: {"topic":"rust"}"#));
}

#[tokio::test]
async fn test_blueprint_review_changes_blueprint_then_edits_params() {
    let schema = json!({
        "type": "object",
        "properties": { "topic": { "type": "string" } },
        "required": ["topic"]
    });
    let catalog = StaticBlueprintCatalog::new()
        .with(Blueprint::new("a", "Drafts an outline", schema.clone()))
        .with(Blueprint::new("b", "Writes the full report", schema));
    let llm = Arc::new(ScriptedLlmClient::new([
        blueprint("a"),
        json!({ "@action": "blueprint-params", "params": { "topic": "first" } }).to_string(),
        json!({ "@action": "blueprint-params", "params": { "topic": "second" } }).to_string(),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .blueprints(Arc::new(catalog))
        .nested_executor(Arc::new(EchoPlan))
        .build()
        .await;
    agent.start();

    let id = agent.submit("write about something").unwrap();
    let first = wait_checkpoint(&mut events).await;
    agent
        .handle_input(InputEvent::InteractiveResponse {
            checkpoint_id: first,
            params: json!({ "suggestion": "change_blueprint", "blueprint": "b" }),
        })
        .await;

    // 换成 b 后重新生成参数，再由审核方直接改参数
    let second = wait_checkpoint(&mut events).await;
    agent
        .handle_input(InputEvent::InteractiveResponse {
            checkpoint_id: second,
            params: json!({ "suggestion": "modify_params", "params": { "topic": "edited" } }),
        })
        .await;

    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::NestedCompleted));
    assert_eq!(snapshot.result.as_deref(), Some(r#"b: {"topic":"edited"}"#));
    assert!(llm.prompts()[2].contains("Writes the full report"));
}

#[tokio::test]
async fn test_wrong_tool_review_then_abandon_answers_directly() {
    let llm = Arc::new(ScriptedLlmClient::new([
        use_tool("echo", false),
        params(json!({ "text": "hello" })),
        json!({ "@action": "wrong-tool", "decision": "abandon" }).to_string(),
        json!({ "@action": "directly-answer", "answer_payload": "fallback" }).to_string(),
    ]));
    let (agent, mut events) = Agent::builder(config(ReviewPolicy::Manual), llm.clone())
        .tool(EchoTool)
        .build()
        .await;
    agent.start();

    let id = agent.submit("say hello").unwrap();
    let checkpoint_id = wait_checkpoint(&mut events).await;
    agent
        .handle_input(InputEvent::InteractiveResponse {
            checkpoint_id,
            params: json!({ "suggestion": "wrong_tool", "extra_prompt": "echo is not needed" }),
        })
        .await;

    let snapshot = finished(&agent, &id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Answered));
    assert_eq!(snapshot.result.as_deref(), Some("fallback"));
    // 审核意见带入选错工具的 prompt
    assert!(llm.prompts()[2].contains("echo is not needed"));
    assert_eq!(llm.calls(), 4);
}

#[tokio::test]
async fn test_timeline_restored_for_same_session() {
    let store: Arc<dyn TimelineStore> = Arc::new(MemoryTimelineStore::new());
    let mut cfg = config(ReviewPolicy::Yolo);
    cfg.session_id = Some("session-1".into());

    let (first, _events) = Agent::builder(cfg.clone(), Arc::new(RoutedLlm))
        .store(store.clone())
        .build()
        .await;
    first.start();
    let id = first.submit("remember me").unwrap();
    finished(&first, &id).await;
    first.shutdown().await;

    let llm = Arc::new(ScriptedLlmClient::new([answer("I remember")]));
    let (second, _events) = Agent::builder(cfg, llm.clone()).store(store).build().await;
    assert!(second.timeline_dump().contains("remember me"));
    second.start();
    let id = second.submit("do you remember?").unwrap();
    finished(&second, &id).await;
    assert!(llm.prompts()[0].contains("done: remember me"));
}
