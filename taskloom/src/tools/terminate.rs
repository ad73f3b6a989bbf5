//! Terminate tool: the model's way to finish a step.

use async_trait::async_trait;
use serde::Deserialize;

use super::TERMINATE_TOOL;
use crate::context::ToolContext;
use crate::tool::{Tool, ToolError, ToolExecuteResult, parse_arguments};

/// Ends the current step; its `message` argument becomes the step result.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateTool;

#[derive(Debug, Deserialize)]
struct TerminateArgs {
    message: String,
}

#[async_trait]
impl Tool for TerminateTool {
    fn name(&self) -> &str {
        TERMINATE_TOOL
    }

    fn description(&self) -> String {
        "Finish the current step. Call this once the step requirement is \
         fulfilled, passing the final answer as `message`."
            .to_owned()
    }

    fn parameters_schema(&self) -> String {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Final answer or result of the step"
                }
            },
            "required": ["message"]
        })
        .to_string()
    }

    async fn execute(
        &self,
        arguments: &str,
        _ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError> {
        let args: TerminateArgs = parse_arguments(arguments)?;
        Ok(ToolExecuteResult::new(args.message))
    }

    fn can_terminate(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;

    #[tokio::test]
    async fn message_becomes_the_result() {
        let tool = TerminateTool;
        assert!(tool.can_terminate());

        let plan = ExecutionContext::root("plan-1", "req");
        let ctx = ToolContext::for_call(&plan, "toolcall-1");
        let result = tool
            .execute(r#"{"message":"all done"}"#, &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "all done");
    }
}
