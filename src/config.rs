//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_REACT__*` 覆盖（双下划线表示嵌套，如 `BEE_REACT__AGENT__MAX_ITERATIONS=20`）。
//! 运行时使用的 AgentConfig 由 AppConfig 转换而来，测试可直接构造 AgentConfig。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::review::{ReviewPolicy, ReviewSettings};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub review: ReviewSection,
    pub tools: ToolsSection,
    pub timeline: TimelineSection,
    pub session: SessionSection,
    pub llm: LlmSection,
}

/// [agent] 段：迭代预算、重试次数、动作开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    /// 每次 AI 事务的最大尝试次数
    pub ai_transaction_retry: usize,
    /// 工具参数校验失败后的重新生成轮数
    pub tool_param_retry: usize,
    /// 工具无法解析时的重新选择轮数
    pub tool_reselect_retry: usize,
    /// 单个任务内最多向用户澄清的次数
    pub user_interactive_limit: usize,
    pub enable_plan_execution: bool,
    pub enable_user_interaction: bool,
    pub language: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            ai_transaction_retry: 5,
            tool_param_retry: 3,
            tool_reselect_retry: 3,
            user_interactive_limit: 3,
            enable_plan_execution: true,
            enable_user_interaction: true,
            language: "zh".to_string(),
        }
    }
}

fn default_max_iterations() -> usize {
    100
}

/// [review] 段：审核策略与自动释放延迟
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    pub policy: ReviewPolicy,
    pub ai_score_low: f64,
    pub ai_score_high: f64,
    pub low_risk_delay_ms: u64,
    pub high_risk_delay_ms: u64,
    pub auto_interval_secs: u64,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            policy: ReviewPolicy::Manual,
            ai_score_low: 0.4,
            ai_score_high: 0.7,
            low_risk_delay_ms: 3_000,
            high_risk_delay_ms: 10_000,
            auto_interval_secs: 10,
        }
    }
}

/// [tools] 段：单次工具调用超时与区间审核间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    /// 0 表示关闭区间审核
    pub interval_review_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            interval_review_secs: 0,
        }
    }
}

/// [timeline] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimelineSection {
    pub max_entries: usize,
    pub max_content_bytes: usize,
}

impl Default for TimelineSection {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_content_bytes: 50 * 1024,
        }
    }
}

/// 时间线存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Json,
    Sqlite,
}

/// [session] 段：设置 session_id 后时间线按会话保存与恢复
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    pub session_id: Option<String>,
    pub store: StoreKind,
    /// json：目录；sqlite：数据库文件
    pub store_path: Option<PathBuf>,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名，未设置时用 OPENAI_API_KEY
    pub api_key_env: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
        }
    }
}

/// 运行时配置（由 AppConfig 转换，或在测试中直接构造）
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub ai_transaction_retry: usize,
    pub tool_param_retry: usize,
    pub tool_reselect_retry: usize,
    pub user_interactive_limit: usize,
    pub enable_plan_execution: bool,
    pub enable_user_interaction: bool,
    pub language: String,
    pub review: ReviewSettings,
    pub tool_timeout: Duration,
    pub interval_review: Option<Duration>,
    pub timeline_max_entries: usize,
    pub timeline_max_content_bytes: usize,
    pub session_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for AgentConfig {
    fn from(c: &AppConfig) -> Self {
        Self {
            max_iterations: c.agent.max_iterations.max(1),
            ai_transaction_retry: c.agent.ai_transaction_retry.max(1),
            tool_param_retry: c.agent.tool_param_retry.max(1),
            tool_reselect_retry: c.agent.tool_reselect_retry,
            user_interactive_limit: c.agent.user_interactive_limit,
            enable_plan_execution: c.agent.enable_plan_execution,
            enable_user_interaction: c.agent.enable_user_interaction,
            language: c.agent.language.clone(),
            review: ReviewSettings {
                policy: c.review.policy,
                ai_score_low: c.review.ai_score_low,
                ai_score_high: c.review.ai_score_high,
                low_risk_delay: Duration::from_millis(c.review.low_risk_delay_ms),
                high_risk_delay: Duration::from_millis(c.review.high_risk_delay_ms),
                auto_interval: Duration::from_secs(c.review.auto_interval_secs),
            },
            tool_timeout: Duration::from_secs(c.tools.tool_timeout_secs.max(1)),
            interval_review: (c.tools.interval_review_secs > 0)
                .then(|| Duration::from_secs(c.tools.interval_review_secs)),
            timeline_max_entries: c.timeline.max_entries.max(1),
            timeline_max_content_bytes: c.timeline.max_content_bytes.max(64),
            session_id: c.session.session_id.clone(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE_REACT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_REACT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_REACT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
