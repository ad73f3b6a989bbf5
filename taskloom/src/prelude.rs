//! Convenience re-exports for embedding applications.

pub use crate::agent::{AgentOutcome, AgentProfile, DynamicAgent, parse_agent_tag};
pub use crate::config::EngineConfig;
pub use crate::context::{ExecutionContext, ToolContext};
pub use crate::dispatch::{
    DispatchStatus, ExecutionOutcome, ParallelExecutionRequest, ParallelExecutionService,
};
pub use crate::error::{EngineError, Result};
pub use crate::executor::PlanExecutor;
pub use crate::id::Ids;
pub use crate::interrupt::{InterruptionManager, RunState};
pub use crate::llm::{ChatProvider, ChatRequest, ChunkStream, LlmError};
pub use crate::memory::{COMPRESSION_SUMMARY_FLAG, MemoryLimitService};
pub use crate::message::{ChatMessage, MessageRole, ToolCall};
pub use crate::pool::{DepthOverflowPolicy, DepthPools, PoolError};
pub use crate::record::{
    ActToolInfo, ActToolResult, AgentExecutionRecord, AgentExecutionSummary, ExecutionStatus,
    HierarchyReader, Plan, PlanExecutionView, RecorderError, SqliteRecorder, Step, StepStatus,
    ThinkActRecord,
};
pub use crate::stream::{StreamAggregator, StreamChunk, StreamingResult};
pub use crate::tool::{
    Tool, ToolDefinition, ToolError, ToolExecuteResult, ToolRegistry, ToolState, parse_arguments,
};
pub use crate::tools::{
    ERROR_REPORT_TOOL, ErrorReportTool, FORM_INPUT_TOOL, FormInputTool, SUBPLAN_TOOL,
    SYSTEM_ERROR_REPORT_TOOL, SubplanTool, SystemErrorReportTool, TERMINATE_TOOL, TerminateTool,
};
pub use crate::wait::{FormState, PendingForm, UserInputWaitRegistry, WaitState};
