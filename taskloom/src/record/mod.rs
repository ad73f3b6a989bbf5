//! Execution recording and hierarchy reads.
//!
//! The recorder is the single gateway to durable state: plans, steps,
//! agent executions, think-act cycles, and tool-call entries all go through
//! [`SqliteRecorder`]. The [`hierarchy`] module reconstructs the plan tree
//! on demand for inspection endpoints.

pub mod hierarchy;
pub mod model;
mod sqlite;

use thiserror::Error;

pub use hierarchy::{AgentExecutionSummary, HierarchyReader, PlanExecutionView};
pub use model::{
    ActToolInfo, AgentExecutionRecord, ExecutionStatus, Plan, Step, StepStatus, ThinkActRecord,
};
pub use sqlite::SqliteRecorder;

/// A type alias for `Result<T, RecorderError>`.
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Errors raised by the execution recorder.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecorderError {
    /// The referenced plan, step, or record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A concurrent update conflicts with the requested write; the caller
    /// may retry.
    #[error("conflicting update: {0}")]
    Conflict(String),

    /// SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error while persisting a record.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The blocking task running the database operation failed.
    #[error("task error: {0}")]
    Task(String),

    /// The connection lock was poisoned.
    #[error("lock error: {0}")]
    Lock(String),
}

/// Post-execution result for one tool call, applied by
/// [`SqliteRecorder::record_action_result`].
///
/// Carries name and parameters as well so an out-of-order result (arriving
/// before its think-act row) can still be inserted.
#[derive(Debug, Clone)]
pub struct ActToolResult {
    /// System-unique tool call id.
    pub tool_call_id: String,
    /// Qualified tool name.
    pub name: String,
    /// JSON arguments string.
    pub parameters: String,
    /// JSON result string.
    pub result: String,
}

impl ActToolResult {
    /// Create a result entry.
    #[must_use]
    pub fn new(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        parameters: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            parameters: parameters.into(),
            result: result.into(),
        }
    }
}
