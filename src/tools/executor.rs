//! 工具执行器
//!
//! 每次调用在父令牌的子令牌下运行，并与超时、取消竞争；超时或失败时转为 AgentError
//! （ToolTimeout / ToolExecutionFailed / ToolCancelled）；每次调用输出结构化审计日志（JSON）。
//!
//! 配置了区间审核时，工具运行期间每隔 interval 把部分输出交给 IntervalReviewer，
//! 决定 Cancel 时只触发工具自己的令牌，不影响所属任务。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::react::events::preview;
use crate::tools::{ToolContext, ToolRegistry};

/// 区间审核结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalDecision {
    Continue,
    Cancel,
}

/// 工具运行期间的周期性审核
#[async_trait]
pub trait IntervalReviewer: Send + Sync {
    async fn review(&self, tool: &str, params: &Value, partial_output: &str) -> IntervalDecision;
}

/// 一次成功的工具调用
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool: String,
    pub params: Value,
    pub output: String,
    pub duration_ms: u64,
}

/// 工具执行器：超时、取消与区间审核
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    interval: Option<(Duration, Arc<dyn IntervalReviewer>)>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            interval: None,
        }
    }

    pub fn with_interval_review(mut self, every: Duration, reviewer: Arc<dyn IntervalReviewer>) -> Self {
        self.interval = Some((every, reviewer));
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具；parent 取消时返回 Cancelled，区间审核取消时返回 ToolCancelled
    pub async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        parent: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let token = parent.child_token();
        let ctx = ToolContext::new(token.clone());
        let run = tool.execute(params.clone(), ctx.clone());
        tokio::pin!(run);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut ticker = self.interval.as_ref().map(|(every, _)| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + *every, *every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker
        });
        let mut in_flight: Option<JoinHandle<()>> = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    break if parent.is_cancelled() {
                        Err(AgentError::Cancelled)
                    } else {
                        Err(AgentError::ToolCancelled(tool_name.to_string()))
                    };
                }
                out = &mut run => {
                    break out.map_err(AgentError::ToolExecutionFailed);
                }
                _ = &mut deadline => {
                    break Err(AgentError::ToolTimeout(tool_name.to_string()));
                }
                _ = tick(&mut ticker) => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        tracing::debug!(tool = tool_name, "Interval review still running, skipping tick");
                        continue;
                    }
                    if let Some((_, reviewer)) = &self.interval {
                        in_flight = Some(spawn_interval_review(
                            reviewer.clone(),
                            tool_name.to_string(),
                            params.clone(),
                            ctx.clone(),
                        ));
                    }
                }
            }
        };
        token.cancel();
        if let Some(handle) = in_flight {
            handle.abort();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::ToolTimeout(_)) => "timeout",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview(&params.to_string(), 200),
        });
        tracing::info!(audit = %audit, "tool");

        result.map(|output| ToolResult {
            tool: tool_name.to_string(),
            params,
            output,
            duration_ms,
        })
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_interval_review(
    reviewer: Arc<dyn IntervalReviewer>,
    tool: String,
    params: Value,
    ctx: ToolContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let partial = ctx.snapshot();
        let decision = reviewer.review(&tool, &params, &partial).await;
        if decision == IntervalDecision::Cancel && !ctx.is_cancelled() {
            tracing::info!(tool = %tool, "Interval review cancelled tool");
            ctx.cancel_token().cancel();
        }
    })
}
