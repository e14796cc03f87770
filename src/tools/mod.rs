//! 工具层：注册表、执行器（超时 / 取消 / 区间审核）与内置 echo 工具

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::{IntervalDecision, IntervalReviewer, ToolExecutor, ToolResult};
pub use registry::{validate_against_schema, Tool, ToolContext, ToolRegistry};
