//! Echo 工具（测试与本地跑通用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext};

/// Echo 工具：回显 text
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<String, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing `text`".to_string())?;
        ctx.write(text);
        Ok(text.to_string())
    }
}
