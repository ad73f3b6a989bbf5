//! Built-in tools the engine's own loop depends on.
//!
//! Everything else (browser automation, file I/O, shells, generators) is an
//! external collaborator registered by the embedding application.

mod error_report;
mod form_input;
mod subplan;
mod terminate;

pub use error_report::{ErrorReportTool, SystemErrorReportTool, extract_error_message};
pub use form_input::FormInputTool;
pub use subplan::SubplanTool;
pub use terminate::TerminateTool;

/// Qualified name of the terminate tool.
pub const TERMINATE_TOOL: &str = "planning-terminate";

/// Qualified name of the LLM-invoked error report tool.
pub const ERROR_REPORT_TOOL: &str = "planning-error_report";

/// Qualified name of the engine-synthesized system error report tool.
pub const SYSTEM_ERROR_REPORT_TOOL: &str = "planning-system_error_report";

/// Qualified name of the form-input tool.
pub const FORM_INPUT_TOOL: &str = "planning-form_input";

/// Qualified name of the sub-plan tool.
pub const SUBPLAN_TOOL: &str = "planning-subplan";

/// Whether a tool name is one of the error-reporting tools.
#[must_use]
pub fn is_error_report_tool(name: &str) -> bool {
    name == ERROR_REPORT_TOOL || name == SYSTEM_ERROR_REPORT_TOOL
}
