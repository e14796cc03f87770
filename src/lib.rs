//! bee-react：ReAct 智能体运行时核心
//!
//! 模块划分：
//! - **agent**: Agent 组装与输入处理入口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务、任务队列、调度、异步移交、输入事件、优雅关闭
//! - **llm**: LLM 客户端抽象、AI 事务与实现（OpenAI 兼容 / Mock）
//! - **memory**: 时间线与按会话持久化
//! - **react**: Action 协议、prompt、ReAct 主循环、工具调用子协议、蓝图
//! - **review**: 审核点与审核策略
//! - **tools**: 工具注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod review;
pub mod tools;

pub use agent::{Agent, AgentBuilder};
pub use config::{AgentConfig, AppConfig};
pub use core::AgentError;
pub use react::ReactEvent;
