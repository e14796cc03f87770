//! 基于模型的风险评分（ai 策略）

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::AiTransaction;
use crate::react::action::parse_json_object;
use crate::react::prompt;
use crate::review::checkpoint::CheckpointKind;
use crate::review::policy::RiskScorer;

pub struct AiRiskScorer {
    tx: AiTransaction,
}

impl AiRiskScorer {
    pub fn new(tx: AiTransaction) -> Self {
        Self { tx }
    }
}

/// 从回复中取出 `risk_score`，必须在 [0, 1] 内
pub fn parse_risk_score(raw: &str) -> Result<f64, String> {
    let obj = parse_json_object(raw).map_err(|e| e.to_string())?;
    let score = obj
        .get("risk_score")
        .and_then(Value::as_f64)
        .ok_or_else(|| "missing numeric `risk_score`".to_string())?;
    if !(0.0..=1.0).contains(&score) {
        return Err(format!("risk_score {score} out of range"));
    }
    Ok(score)
}

#[async_trait]
impl RiskScorer for AiRiskScorer {
    async fn score(
        &self,
        kind: CheckpointKind,
        materials: &Value,
        cancel: &CancellationToken,
    ) -> Result<f64, AgentError> {
        let input = materials
            .get("input")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let p = prompt::risk_score(input, kind.as_str(), &materials.to_string());
        let score = self.tx.call(&p, cancel, parse_risk_score).await?;
        tracing::debug!(kind = kind.as_str(), score, "Risk scored");
        Ok(score)
    }
}
