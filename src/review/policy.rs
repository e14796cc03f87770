//! 审核策略与 wait-agree 协议
//!
//! 策略按实例配置（不是按调用）：
//! - `yolo`：立即以合成的 continue 释放
//! - `ai`：后台评分；分数 <= low 短延迟后自动释放，>= high 长延迟后自动释放，中间值等人工
//! - `auto`：固定间隔后自动释放，人工可抢先回应
//! - `manual`：一直等待外部按 id 回应
//!
//! 所有自动释放都由子令牌控制的延迟任务完成，取消任务即取消待执行的自动释放。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::task::Task;
use crate::core::AgentError;
use crate::review::checkpoint::{Checkpoint, CheckpointKind, CheckpointManager, ReviewParams};

/// 审核策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPolicy {
    Yolo,
    Ai,
    Auto,
    Manual,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self::Manual
    }
}

/// 审核相关配置
#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub policy: ReviewPolicy,
    pub ai_score_low: f64,
    pub ai_score_high: f64,
    pub low_risk_delay: Duration,
    pub high_risk_delay: Duration,
    pub auto_interval: Duration,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            policy: ReviewPolicy::Manual,
            ai_score_low: 0.4,
            ai_score_high: 0.7,
            low_risk_delay: Duration::from_secs(3),
            high_risk_delay: Duration::from_secs(10),
            auto_interval: Duration::from_secs(10),
        }
    }
}

/// 风险分档
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Middle,
    High,
}

pub fn classify_risk(score: f64, low: f64, high: f64) -> RiskLevel {
    if score <= low {
        RiskLevel::Low
    } else if score >= high {
        RiskLevel::High
    } else {
        RiskLevel::Middle
    }
}

/// 风险评分（0.0 ~ 1.0）
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn score(
        &self,
        kind: CheckpointKind,
        materials: &Value,
        cancel: &CancellationToken,
    ) -> Result<f64, AgentError>;
}

/// 审核员：创建审核点并按策略等待释放
pub struct Reviewer {
    settings: ReviewSettings,
    manager: Arc<CheckpointManager>,
    scorer: Option<Arc<dyn RiskScorer>>,
}

impl Reviewer {
    pub fn new(settings: ReviewSettings, manager: Arc<CheckpointManager>) -> Self {
        Self {
            settings,
            manager,
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RiskScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn policy(&self) -> ReviewPolicy {
        self.settings.policy
    }

    pub fn manager(&self) -> &Arc<CheckpointManager> {
        &self.manager
    }

    /// 按配置的策略审核；返回审核参数
    pub async fn review(
        &self,
        kind: CheckpointKind,
        task: &Task,
        materials: Value,
    ) -> Result<ReviewParams, AgentError> {
        let cp = self.manager.create(kind, Some(task.id()), materials);
        let result = self.wait_agree(&cp, task.cancel_token()).await;
        self.manager.discard(cp.id());
        result
    }

    /// 阻塞等待人工回应（澄清问题），不受策略影响
    pub async fn ask(
        &self,
        kind: CheckpointKind,
        task: &Task,
        materials: Value,
    ) -> Result<ReviewParams, AgentError> {
        let cp = self.manager.create(kind, Some(task.id()), materials);
        let result = cp.wait(task.cancel_token()).await;
        self.manager.discard(cp.id());
        result
    }

    async fn wait_agree(
        &self,
        cp: &Arc<Checkpoint>,
        cancel: &CancellationToken,
    ) -> Result<ReviewParams, AgentError> {
        match self.settings.policy {
            ReviewPolicy::Yolo => {
                self.manager.release(cp.id(), ReviewParams::approve("yolo"))?;
                cp.wait(cancel).await
            }
            ReviewPolicy::Manual => cp.wait(cancel).await,
            ReviewPolicy::Auto => {
                let scope = cancel.child_token();
                spawn_delayed_release(
                    self.manager.clone(),
                    cp.id().to_string(),
                    self.settings.auto_interval,
                    scope.clone(),
                    ReviewParams::approve("auto"),
                );
                let result = cp.wait(cancel).await;
                scope.cancel();
                result
            }
            ReviewPolicy::Ai => {
                let Some(scorer) = self.scorer.clone() else {
                    tracing::warn!("AI review policy without a risk scorer, waiting for manual review");
                    return cp.wait(cancel).await;
                };
                let scope = cancel.child_token();
                self.spawn_scored_review(scorer, cp.clone(), scope.clone());
                let result = cp.wait(cancel).await;
                scope.cancel();
                result
            }
        }
    }

    fn spawn_scored_review(
        &self,
        scorer: Arc<dyn RiskScorer>,
        cp: Arc<Checkpoint>,
        scope: CancellationToken,
    ) {
        let manager = self.manager.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let score = match scorer.score(cp.kind(), cp.materials(), &scope).await {
                Ok(score) => score,
                Err(e) => {
                    tracing::warn!(checkpoint_id = %cp.id(), "Risk scoring failed, waiting for manual review: {}", e);
                    return;
                }
            };
            let delay = match classify_risk(score, settings.ai_score_low, settings.ai_score_high) {
                RiskLevel::Low => settings.low_risk_delay,
                RiskLevel::High => settings.high_risk_delay,
                RiskLevel::Middle => {
                    tracing::info!(checkpoint_id = %cp.id(), score, "Risk score in middle band, waiting for manual review");
                    return;
                }
            };
            tracing::info!(checkpoint_id = %cp.id(), score, "Auto release scheduled in {:?}", delay);
            let params = ReviewParams::approve("ai").with("risk_score", score);
            delayed_release(&manager, cp.id(), delay, &scope, params).await;
        });
    }
}

fn spawn_delayed_release(
    manager: Arc<CheckpointManager>,
    checkpoint_id: String,
    delay: Duration,
    scope: CancellationToken,
    params: ReviewParams,
) {
    tokio::spawn(async move {
        delayed_release(&manager, &checkpoint_id, delay, &scope, params).await;
    });
}

/// 延迟释放；scope 取消或人工已释放时什么都不做
async fn delayed_release(
    manager: &CheckpointManager,
    checkpoint_id: &str,
    delay: Duration,
    scope: &CancellationToken,
    params: ReviewParams,
) {
    tokio::select! {
        _ = scope.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            match manager.release(checkpoint_id, params) {
                Ok(()) => {}
                Err(AgentError::CheckpointAlreadyReleased(_)) | Err(AgentError::UnknownCheckpoint(_)) => {}
                Err(e) => tracing::warn!(checkpoint_id, "Delayed release failed: {}", e),
            }
        }
    }
}
