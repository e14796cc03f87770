//! 审核层：审核点、审核策略、风险评分

pub mod checkpoint;
pub mod policy;
pub mod scorer;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointManager, CheckpointState, ReviewParams};
pub use policy::{classify_risk, Reviewer, ReviewPolicy, ReviewSettings, RiskLevel, RiskScorer};
pub use scorer::AiRiskScorer;
