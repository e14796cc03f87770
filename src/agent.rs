//! Agent 运行时
//!
//! AgentBuilder 组装一个 agent 实例的全部组件（队列、调度器、主循环、审核员、
//! 移交控制器、会话时间线），Agent 对外提供提交任务与处理输入事件的入口。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AppConfig};
use crate::core::handoff::{HandoffController, NestedExecutor};
use crate::core::orchestrator::{InputEvent, SyncSignal};
use crate::core::task::{Task, TaskId, TaskSnapshot};
use crate::core::task_queue::{EnqueueOutcome, HookDecision, TaskQueue};
use crate::core::task_scheduler::TaskScheduler;
use crate::core::AgentError;
use crate::llm::{create_llm_from_config, AiTransaction, LlmClient};
use crate::memory::{create_store_from_config, SessionTimeline, Timeline, TimelineStore};
use crate::react::blueprint::BlueprintCatalog;
use crate::react::context::{ContextProvider, FocusMode};
use crate::react::events::{EventEmitter, ReactEvent};
use crate::react::loop_::{ReactLoop, ReactRuntime};
use crate::review::{
    AiRiskScorer, Checkpoint, CheckpointManager, ReviewParams, ReviewPolicy, Reviewer, RiskScorer,
};
use crate::tools::{IntervalReviewer, Tool, ToolExecutor, ToolRegistry};

type EnqueueHookFn = dyn Fn(&Task) -> Result<HookDecision, String> + Send + Sync;

/// 主队列名
const MAIN_QUEUE: &str = "main";

pub struct AgentBuilder {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    blueprints: Option<Arc<dyn BlueprintCatalog>>,
    nested: Option<Arc<dyn NestedExecutor>>,
    contexts: Vec<Arc<dyn ContextProvider>>,
    focus_modes: HashMap<String, FocusMode>,
    enqueue_hooks: Vec<(String, Box<EnqueueHookFn>)>,
    interval_reviewer: Option<Arc<dyn IntervalReviewer>>,
    scorer: Option<Arc<dyn RiskScorer>>,
    store: Option<Arc<dyn TimelineStore>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            tools: ToolRegistry::new(),
            blueprints: None,
            nested: None,
            contexts: Vec::new(),
            focus_modes: HashMap::new(),
            enqueue_hooks: Vec::new(),
            interval_reviewer: None,
            scorer: None,
            store: None,
        }
    }

    /// 按应用配置选择 LLM 后端与时间线存储
    pub fn from_app_config(app: &AppConfig) -> anyhow::Result<Self> {
        let store = create_store_from_config(&app.session)?;
        let mut builder = Self::new(AgentConfig::from(app), create_llm_from_config(&app.llm));
        builder.store = store;
        Ok(builder)
    }

    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.tools = registry;
        self
    }

    pub fn blueprints(mut self, catalog: Arc<dyn BlueprintCatalog>) -> Self {
        self.blueprints = Some(catalog);
        self
    }

    pub fn nested_executor(mut self, executor: Arc<dyn NestedExecutor>) -> Self {
        self.nested = Some(executor);
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.contexts.push(provider);
        self
    }

    pub fn focus_mode(mut self, mode: FocusMode) -> Self {
        self.focus_modes.insert(mode.name.clone(), mode);
        self
    }

    /// 入队 hook，按注册顺序执行
    pub fn on_enqueue<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Task) -> Result<HookDecision, String> + Send + Sync + 'static,
    {
        self.enqueue_hooks.push((name.into(), Box::new(f)));
        self
    }

    /// 工具运行期间的区间审核（间隔取 config.interval_review）
    pub fn interval_reviewer(mut self, reviewer: Arc<dyn IntervalReviewer>) -> Self {
        self.interval_reviewer = Some(reviewer);
        self
    }

    /// ai 策略的风险评分；未设置时使用模型评分
    pub fn risk_scorer(mut self, scorer: Arc<dyn RiskScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn store(mut self, store: Arc<dyn TimelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 组装 agent；有 session_id 与存储时先恢复时间线
    pub async fn build(self) -> (Arc<Agent>, mpsc::UnboundedReceiver<ReactEvent>) {
        let cfg = self.config;
        let (emitter, events) = EventEmitter::channel();

        let session = Arc::new(SessionTimeline::new(
            Timeline::new(cfg.timeline_max_entries, cfg.timeline_max_content_bytes),
            self.store,
            cfg.session_id.clone(),
        ));
        session.load().await;

        let tx = AiTransaction::new(self.llm, cfg.ai_transaction_retry);
        let checkpoints = Arc::new(CheckpointManager::new(emitter.clone()));
        let mut reviewer = Reviewer::new(cfg.review.clone(), checkpoints.clone());
        let scorer = self.scorer.or_else(|| {
            (cfg.review.policy == ReviewPolicy::Ai)
                .then(|| Arc::new(AiRiskScorer::new(tx.clone())) as Arc<dyn RiskScorer>)
        });
        if let Some(scorer) = scorer {
            reviewer = reviewer.with_scorer(scorer);
        }

        let mut executor = ToolExecutor::new(Arc::new(self.tools), cfg.tool_timeout);
        if let (Some(every), Some(r)) = (cfg.interval_review, self.interval_reviewer) {
            executor = executor.with_interval_review(every, r);
        }

        let handoff = Arc::new(HandoffController::new(
            self.nested,
            session.clone(),
            emitter.clone(),
        ));

        let runtime = Arc::new(ReactRuntime {
            config: cfg.clone(),
            tx,
            executor,
            reviewer: Arc::new(reviewer),
            session: session.clone(),
            handoff: handoff.clone(),
            blueprints: self.blueprints,
            contexts: self.contexts,
            focus_modes: self.focus_modes,
            emitter: emitter.clone(),
        });

        let mut queue = TaskQueue::builder(MAIN_QUEUE);
        for (name, hook) in self.enqueue_hooks {
            queue = queue.on_enqueue(name, hook);
        }
        let dequeued = emitter.clone();
        queue = queue.on_dequeue(move |task, reason| {
            dequeued.emit(ReactEvent::TaskDequeued {
                task_id: task.id().to_string(),
                reason,
            })
        });

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(queue.build()),
            Arc::new(ReactLoop::new(runtime)),
            handoff.clone(),
            emitter.clone(),
        ));

        let agent = Agent {
            config: cfg,
            root: CancellationToken::new(),
            scheduler,
            handoff,
            checkpoints,
            session,
            emitter,
        };
        (Arc::new(agent), events)
    }
}

/// 一个 agent 实例：一个主队列，同一时刻最多一个任务在处理
pub struct Agent {
    config: AgentConfig,
    root: CancellationToken,
    scheduler: Arc<TaskScheduler>,
    handoff: Arc<HandoffController>,
    checkpoints: Arc<CheckpointManager>,
    session: Arc<SessionTimeline>,
    emitter: EventEmitter,
}

impl Agent {
    pub fn builder(config: AgentConfig, llm: Arc<dyn LlmClient>) -> AgentBuilder {
        AgentBuilder::new(config, llm)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 根取消令牌；所有任务令牌都是它的子令牌
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn session(&self) -> &Arc<SessionTimeline> {
        &self.session
    }

    /// 启动调度循环
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run(self.root.clone()))
    }

    pub fn submit(&self, input: impl Into<String>) -> Result<TaskId, AgentError> {
        self.enqueue(Task::new(input, &self.root))
    }

    pub fn submit_with_focus(
        &self,
        input: impl Into<String>,
        focus_mode: impl Into<String>,
    ) -> Result<TaskId, AgentError> {
        self.enqueue(Task::new(input, &self.root).with_focus_mode(focus_mode))
    }

    /// 被 hook 跳过的任务仍返回 id，但不会被调度（`task` 查不到）
    fn enqueue(&self, task: Task) -> Result<TaskId, AgentError> {
        let task_id = task.id().to_string();
        match self.scheduler.submit(Arc::new(task))? {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Skipped { hook } => {
                tracing::info!(task_id = %task_id, hook = %hook, "Task skipped by enqueue hook");
            }
        }
        Ok(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.scheduler.task(task_id)
    }

    /// 等待任务到达终态；未知任务返回 None
    pub async fn wait_for_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        let task = self.scheduler.task(task_id)?;
        task.wait_terminal().await;
        Some(task.snapshot())
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.scheduler.current()
    }

    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.scheduler.queued_ids()
    }

    pub fn queue_state(&self) -> ReactEvent {
        self.scheduler.queue_state()
    }

    /// 等待回应的审核点（按创建顺序）
    pub fn checkpoints(&self) -> Vec<Arc<Checkpoint>> {
        self.checkpoints.pending()
    }

    pub fn release_checkpoint(&self, checkpoint_id: &str, params: ReviewParams) -> Result<(), AgentError> {
        self.checkpoints.release(checkpoint_id, params)
    }

    pub fn timeline_dump(&self) -> String {
        self.session.timeline().dump()
    }

    /// 处理一个外部输入事件；失败只以 warning 事件报告
    pub async fn handle_input(&self, event: InputEvent) {
        match event {
            InputEvent::FreeInput { text, focus_mode } => {
                let result = match focus_mode {
                    Some(mode) => self.submit_with_focus(text, mode),
                    None => self.submit(text),
                };
                if let Err(e) = result {
                    tracing::info!("Free input not enqueued: {}", e);
                }
            }
            InputEvent::InteractiveResponse {
                checkpoint_id,
                params,
            } => {
                if self.checkpoints.contains(&checkpoint_id) {
                    if let Err(e) = self
                        .checkpoints
                        .release(&checkpoint_id, ReviewParams::from_value(params))
                    {
                        self.emitter.warn(None, e.to_string());
                    }
                    return;
                }
                // 不是本实例的审核点：可能属于嵌套执行
                let event = InputEvent::InteractiveResponse {
                    checkpoint_id: checkpoint_id.clone(),
                    params,
                };
                if !self.handoff.forward_any(event) {
                    self.emitter
                        .warn(None, AgentError::UnknownCheckpoint(checkpoint_id).to_string());
                }
            }
            InputEvent::Sync { signal, task_id } => {
                if let Err(e) = self.handle_sync(signal, task_id).await {
                    self.emitter.warn(None, e.to_string());
                }
            }
        }
    }

    async fn handle_sync(&self, signal: SyncSignal, task_id: Option<String>) -> Result<(), AgentError> {
        match signal {
            SyncSignal::CancelCurrentTask => {
                self.scheduler.cancel_task(task_id.as_deref()).await?;
            }
            SyncSignal::JumpQueue | SyncSignal::RemoveTask => {
                let id = task_id.ok_or_else(|| AgentError::TaskNotFound("(missing task_id)".into()))?;
                if self.handoff.has_active(&id) {
                    // 移交中的任务由嵌套执行自行处理
                    self.handoff
                        .forward(&id, InputEvent::sync(signal, Some(id.as_str())));
                } else if signal == SyncSignal::JumpQueue {
                    self.scheduler.jump_queue(&id).await?;
                } else {
                    self.scheduler.remove_task(&id).await?;
                }
            }
            SyncSignal::QueryQueue => self.emitter.emit(self.scheduler.queue_state()),
            SyncSignal::QueryTimeline => self.emitter.emit(ReactEvent::Timeline {
                dump: self.timeline_dump(),
            }),
        }
        Ok(())
    }

    /// 中止所有任务并落盘时间线
    pub async fn shutdown(&self) {
        tracing::info!("Agent shutting down");
        self.scheduler.shutdown().await;
        self.root.cancel();
        self.session.persist().await;
    }
}
