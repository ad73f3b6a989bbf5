//! Error-reporting tools.
//!
//! [`ErrorReportTool`] lets the model report an unrecoverable problem with
//! the step; [`SystemErrorReportTool`] is synthesized by the agent itself
//! when LLM retries are exhausted, so infrastructure failures show up in
//! the record in the same shape as any other tool outcome.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ERROR_REPORT_TOOL, SYSTEM_ERROR_REPORT_TOOL};
use crate::context::ToolContext;
use crate::tool::{Tool, ToolError, ToolExecuteResult, parse_arguments};

#[derive(Debug, Deserialize)]
struct ErrorReportArgs {
    error_message: String,
}

/// Extract the `error_message` argument from a report tool's parameters.
#[must_use]
pub fn extract_error_message(parameters: &str) -> Option<String> {
    serde_json::from_str::<ErrorReportArgs>(parameters)
        .ok()
        .map(|args| args.error_message)
}

fn report_schema() -> String {
    serde_json::json!({
        "type": "object",
        "properties": {
            "error_message": {
                "type": "string",
                "description": "Description of the unrecoverable problem"
            }
        },
        "required": ["error_message"]
    })
    .to_string()
}

/// Model-invoked report that the step cannot be completed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorReportTool;

#[async_trait]
impl Tool for ErrorReportTool {
    fn name(&self) -> &str {
        ERROR_REPORT_TOOL
    }

    fn description(&self) -> String {
        "Report that the step cannot be completed. The error message is \
         attached to the step and the plan stops."
            .to_owned()
    }

    fn parameters_schema(&self) -> String {
        report_schema()
    }

    async fn execute(
        &self,
        arguments: &str,
        _ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError> {
        let args: ErrorReportArgs = parse_arguments(arguments)?;
        Ok(ToolExecuteResult::new(format!(
            "Error reported: {}",
            args.error_message
        )))
    }

    fn can_terminate(&self) -> bool {
        true
    }
}

/// Engine-synthesized report carrying the latest LLM failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemErrorReportTool;

#[async_trait]
impl Tool for SystemErrorReportTool {
    fn name(&self) -> &str {
        SYSTEM_ERROR_REPORT_TOOL
    }

    fn description(&self) -> String {
        "Internal report of an infrastructure failure. Not intended for \
         model use."
            .to_owned()
    }

    fn parameters_schema(&self) -> String {
        report_schema()
    }

    async fn execute(
        &self,
        arguments: &str,
        _ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError> {
        let args: ErrorReportArgs = parse_arguments(arguments)?;
        Ok(ToolExecuteResult::new(format!(
            "System error: {}",
            args.error_message
        )))
    }

    fn can_terminate(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn error_message_extraction() {
        let params = r#"{"error_message":"disk full"}"#;
        assert_eq!(extract_error_message(params).as_deref(), Some("disk full"));
        assert!(extract_error_message("{}").is_none());
        assert!(extract_error_message("not json").is_none());
    }

    #[test]
    fn report_tools_are_terminable() {
        assert!(ErrorReportTool.can_terminate());
        assert!(SystemErrorReportTool.can_terminate());
    }
}
