//! ReAct 主循环（动作分发）
//!
//! 每轮：组装 prompt -> AI 事务 -> 解析 Action -> 按变体分发 -> 下一轮。
//! - 单轮模型调用失败只记录并进入下一轮，不会中止任务
//! - 迭代预算耗尽是正常停止（Completed，无结果）
//! - 任务令牌触发时立即退出，由调度器置为 Aborted
//! - 计划 / 蓝图执行移交后主循环直接退出（Deferred），终态由嵌套执行决定

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::AgentConfig;
use crate::core::handoff::{HandoffController, NestedRequest};
use crate::core::task::{FinishReason, Task};
use crate::core::task_scheduler::{LoopOutcome, TaskRunner};
use crate::core::{ActionParseError, AgentError};
use crate::llm::AiTransaction;
use crate::memory::{EntryKind, SessionTimeline, Timeline};
use crate::react::action::{all_actions, parse_action, Action, ActionKind, ActionSet, ActionType};
use crate::react::blueprint::{run_forge, BlueprintCatalog, ForgeOutcome};
use crate::react::context::{self, ContextProvider, FocusMode};
use crate::react::events::{EventEmitter, ReactEvent};
use crate::react::prompt::{self, LoopPrompt};
use crate::react::tool_use::{run_tool_use, ToolUseOutcome};
use crate::react::verify::verify_satisfaction;
use crate::review::{CheckpointKind, Reviewer};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 主循环依赖的全部协作者（每个 agent 实例一份）
pub struct ReactRuntime {
    pub(crate) config: AgentConfig,
    pub(crate) tx: AiTransaction,
    pub(crate) executor: ToolExecutor,
    pub(crate) reviewer: Arc<Reviewer>,
    pub(crate) session: Arc<SessionTimeline>,
    pub(crate) handoff: Arc<HandoffController>,
    pub(crate) blueprints: Option<Arc<dyn BlueprintCatalog>>,
    pub(crate) contexts: Vec<Arc<dyn ContextProvider>>,
    pub(crate) focus_modes: HashMap<String, FocusMode>,
    pub(crate) emitter: EventEmitter,
}

impl ReactRuntime {
    pub(crate) fn registry(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    pub(crate) fn timeline(&self) -> &Timeline {
        self.session.timeline()
    }

    /// 本任务还能否向用户澄清
    pub(crate) fn clarification_available(&self, task: &Task) -> bool {
        self.config.enable_user_interaction
            && task.clarification_count() < self.config.user_interactive_limit
    }

    /// 阻塞等待用户回答（不受审核策略影响），回答记入时间线
    pub(crate) async fn ask_user(
        &self,
        task: &Task,
        question: &str,
        options: &[String],
    ) -> Result<String, AgentError> {
        let materials = json!({ "question": question, "options": options });
        let params = self
            .reviewer
            .ask(CheckpointKind::Clarification, task, materials)
            .await?;
        let count = task.record_clarification();
        let answer = params.answer();
        tracing::info!(task_id = %task.id(), count, "Clarification answered");
        self.timeline().add(
            Some(task.id()),
            EntryKind::Clarification,
            format!("Q: {question}\nA: {answer}"),
        );
        Ok(answer)
    }

    fn focus_mode(&self, task: &Task) -> Option<&FocusMode> {
        let name = task.focus_mode()?;
        let mode = self.focus_modes.get(name);
        if mode.is_none() {
            tracing::warn!(task_id = %task.id(), focus_mode = name, "Unknown focus mode, using default loop");
        }
        mode
    }

    /// 本轮允许的动作
    pub(crate) fn allowed_actions(&self, task: &Task, focus: Option<&FocusMode>) -> ActionSet {
        let mut set = all_actions();
        let nested_ok = self.config.enable_plan_execution
            && self.handoff.is_enabled()
            && task.async_execution().is_none()
            && !self.handoff.has_active(task.id());
        if !nested_ok {
            set.retain(|a| !a.is_nested());
        }
        if self.blueprints.as_ref().map_or(true, |c| c.list().is_empty()) {
            set.remove(&ActionType::RequireAiBlueprint);
        }
        if self.registry().is_empty() {
            set.remove(&ActionType::RequireTool);
        }
        if !self.clarification_available(task) {
            set.remove(&ActionType::AskForClarification);
        }
        if let Some(mode) = focus {
            set = mode.restrict(&set);
        }
        if set.is_empty() {
            set.insert(ActionType::DirectlyAnswer);
        }
        set
    }
}

/// 一次分发后的去向
enum Step {
    Continue,
    Finish(LoopOutcome),
}

/// 主循环：实现 TaskRunner，供调度器逐个任务调用
pub struct ReactLoop {
    rt: Arc<ReactRuntime>,
}

impl ReactLoop {
    pub fn new(rt: Arc<ReactRuntime>) -> Self {
        Self { rt }
    }

    async fn drive(&self, task: &Arc<Task>) -> LoopOutcome {
        let rt = &self.rt;
        let max = rt.config.max_iterations;
        let focus = rt.focus_mode(task);

        loop {
            if task.is_cancelled() {
                return LoopOutcome::Cancelled;
            }
            if task.iteration() >= max {
                tracing::warn!(task_id = %task.id(), max, "Iteration budget exhausted");
                rt.timeline().add(
                    Some(task.id()),
                    EntryKind::Error,
                    format!("iteration budget of {max} exhausted without an answer"),
                );
                return LoopOutcome::Finished {
                    reason: FinishReason::IterationBudgetExhausted,
                    result: None,
                };
            }

            let iteration = task.next_iteration();
            rt.emitter.emit(ReactEvent::Iteration {
                task_id: task.id().to_string(),
                current: iteration,
                max,
            });

            let action = match self.decide(task, iteration, focus).await {
                Ok(action) => action,
                Err(e) if e.is_cancelled() => return LoopOutcome::Cancelled,
                Err(e) => {
                    rt.emitter
                        .warn(Some(task.id()), format!("iteration {iteration}: no usable action: {e}"));
                    rt.timeline()
                        .add(Some(task.id()), EntryKind::Error, e.to_string());
                    rt.session.persist().await;
                    continue;
                }
            };

            let step = self.dispatch(task, action).await;
            rt.session.persist().await;
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Finish(outcome)) => return outcome,
                Err(e) if e.is_cancelled() => return LoopOutcome::Cancelled,
                Err(e) => {
                    task.record_error(e.to_string());
                    rt.emitter.warn(Some(task.id()), e.to_string());
                    rt.timeline()
                        .add(Some(task.id()), EntryKind::Error, e.to_string());
                }
            }
        }
    }

    /// 组装 prompt 并通过 AI 事务得到一个合法 Action
    async fn decide(
        &self,
        task: &Task,
        iteration: usize,
        focus: Option<&FocusMode>,
    ) -> Result<Action, AgentError> {
        let rt = &self.rt;
        let allowed = rt.allowed_actions(task, focus);
        let tools = rt.registry().tool_descriptions();
        let blueprints: Vec<(String, String)> = match &rt.blueprints {
            Some(c) if allowed.contains(&ActionType::RequireAiBlueprint) => c
                .list()
                .into_iter()
                .map(|b| (b.name, b.description))
                .collect(),
            _ => Vec::new(),
        };
        let dynamic = context::collect(&rt.contexts, task).await;
        let timeline = rt.timeline().dump();
        let p = prompt::main_loop(&LoopPrompt {
            input: task.input(),
            language: &rt.config.language,
            iteration,
            max_iterations: rt.config.max_iterations,
            tools: &tools,
            blueprints: &blueprints,
            timeline: &timeline,
            dynamic_context: &dynamic,
            focus_hint: focus.and_then(|m| m.prompt_hint.as_deref()),
            allowed: Some(&allowed),
        });

        let catalog = rt.blueprints.clone();
        let action = rt
            .tx
            .call(&p, task.cancel_token(), |raw| {
                let action = parse_action(raw, &allowed)?;
                if let ActionKind::RequireBlueprintForge { blueprint, .. } = &action.kind {
                    if !catalog.as_ref().is_some_and(|c| c.get(blueprint).is_some()) {
                        return Err(ActionParseError::InvalidPayload {
                            action: ActionType::RequireAiBlueprint.to_string(),
                            reason: format!("unknown blueprint `{blueprint}`"),
                        });
                    }
                }
                Ok::<_, ActionParseError>(action)
            })
            .await?;

        rt.emitter.emit(ReactEvent::Thought {
            task_id: task.id().to_string(),
            text: action.thought.clone(),
        });
        rt.emitter.emit(ReactEvent::Action {
            task_id: task.id().to_string(),
            action: action.kind.action_type().to_string(),
        });
        rt.timeline()
            .add(Some(task.id()), EntryKind::Thought, &action.thought);
        if let Some(summary) = &action.cumulative_summary {
            rt.timeline().set_summary(summary);
        }
        Ok(action)
    }

    async fn dispatch(&self, task: &Arc<Task>, action: Action) -> Result<Step, AgentError> {
        let rt = &self.rt;
        match action.kind {
            ActionKind::DirectlyAnswer { answer } => Ok(self.answer(task, answer, FinishReason::Answered)),

            ActionKind::RequireTool { tool, middle_step } => {
                match run_tool_use(rt, task, &tool).await? {
                    ToolUseOutcome::Executed(_) if middle_step => Ok(Step::Continue),
                    ToolUseOutcome::Executed(result) => {
                        let verdict = verify_satisfaction(
                            &rt.tx,
                            task.input(),
                            &result.tool,
                            &result.output,
                            &rt.timeline().dump(),
                            task.cancel_token(),
                        )
                        .await;
                        match verdict {
                            Ok(v) if v.satisfied => Ok(self.answer(task, v.result, FinishReason::Satisfied)),
                            Ok(v) => {
                                tracing::info!(task_id = %task.id(), "User need not yet satisfied, continuing");
                                rt.timeline().add(
                                    Some(task.id()),
                                    EntryKind::Thought,
                                    format!("not satisfied yet: {} ({})", v.result, v.reasoning),
                                );
                                Ok(Step::Continue)
                            }
                            Err(e) if e.is_cancelled() => Err(e),
                            Err(e) => {
                                // 校验本身失败时结束任务，避免无限循环
                                task.record_error(e.to_string());
                                rt.timeline()
                                    .add(Some(task.id()), EntryKind::Error, e.to_string());
                                rt.emitter
                                    .warn(Some(task.id()), format!("verification failed: {e}"));
                                Ok(Step::Finish(LoopOutcome::Finished {
                                    reason: FinishReason::VerificationFailed,
                                    result: None,
                                }))
                            }
                        }
                    }
                    ToolUseOutcome::DirectAnswer(answer) => Ok(self.answer(task, answer, FinishReason::Answered)),
                    ToolUseOutcome::Clarified(_) => Ok(Step::Continue),
                    ToolUseOutcome::Failed(reason) => {
                        rt.timeline().add(
                            Some(task.id()),
                            EntryKind::Error,
                            format!("tool `{tool}` failed: {reason}"),
                        );
                        Ok(Step::Continue)
                    }
                    ToolUseOutcome::Rejected => Ok(self.rejected(task, "tool call")),
                }
            }

            ActionKind::RequestPlanExecution { plan } => {
                Ok(self.hand_off(task, NestedRequest::Plan { payload: plan }))
            }

            ActionKind::AskForClarification { question, options } => {
                rt.ask_user(task, &question, &options).await?;
                Ok(Step::Continue)
            }

            ActionKind::RequireBlueprintForge { blueprint, request } => {
                let Some(catalog) = rt.blueprints.clone() else {
                    return Err(AgentError::NestedExecutionFailed("no blueprint catalog".into()));
                };
                match run_forge(rt, task, catalog.as_ref(), &blueprint, request.as_deref()).await? {
                    ForgeOutcome::Approved { blueprint, params } => {
                        Ok(self.hand_off(task, NestedRequest::Blueprint { name: blueprint, params }))
                    }
                    ForgeOutcome::Rejected => Ok(self.rejected(task, "blueprint")),
                    ForgeOutcome::Failed(reason) => {
                        rt.timeline().add(
                            Some(task.id()),
                            EntryKind::Error,
                            format!("blueprint `{blueprint}` failed: {reason}"),
                        );
                        Ok(Step::Continue)
                    }
                }
            }
        }
    }

    fn answer(&self, task: &Task, answer: String, reason: FinishReason) -> Step {
        self.rt
            .timeline()
            .add(Some(task.id()), EntryKind::Answer, &answer);
        self.rt.emitter.emit(ReactEvent::Result {
            task_id: task.id().to_string(),
            content: answer.clone(),
        });
        Step::Finish(LoopOutcome::Finished {
            reason,
            result: Some(answer),
        })
    }

    fn rejected(&self, task: &Task, what: &str) -> Step {
        tracing::info!(task_id = %task.id(), "{} rejected by review", what);
        self.rt.timeline().add(
            Some(task.id()),
            EntryKind::Error,
            format!("{what} rejected by review"),
        );
        Step::Finish(LoopOutcome::Finished {
            reason: FinishReason::ReviewRejected,
            result: None,
        })
    }

    fn hand_off(&self, task: &Arc<Task>, request: NestedRequest) -> Step {
        match self.rt.handoff.start(task, request) {
            Ok(execution_id) => Step::Finish(LoopOutcome::Deferred { execution_id }),
            Err(e) => {
                self.rt.emitter.warn(Some(task.id()), e.to_string());
                self.rt
                    .timeline()
                    .add(Some(task.id()), EntryKind::Error, e.to_string());
                Step::Continue
            }
        }
    }
}

#[async_trait]
impl TaskRunner for ReactLoop {
    async fn run(&self, task: Arc<Task>) -> LoopOutcome {
        self.rt
            .timeline()
            .add(Some(task.id()), EntryKind::UserInput, task.input());
        let outcome = self.drive(&task).await;
        self.rt.session.persist().await;
        outcome
    }
}
