//! Persisted execution entities.
//!
//! A [`Plan`] owns its ordered [`Step`]s; each step execution produces an
//! [`AgentExecutionRecord`] which owns ordered [`ThinkActRecord`]s, which in
//! turn own [`ActToolInfo`] entries. A sub-plan is linked to the tool call
//! that spawned it by id only: `sub.tool_call_id == ActToolInfo.tool_call_id`.
//! There are no back-pointers; the recorder joins on demand.

use serde::{Deserialize, Serialize};

use crate::id::now_millis;

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Created with the plan, not yet picked up.
    #[default]
    NotStarted,
    /// An agent is working on the step.
    InProgress,
    /// Step finished successfully.
    Completed,
    /// Step failed; the plan stops.
    Failed,
    /// Step was interrupted by a cancellation request.
    Interrupted,
}

impl StepStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
        }
    }

    /// Parse from the persisted string form. Unknown values map to
    /// `NotStarted`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "INTERRUPTED" => Self::Interrupted,
            _ => Self::NotStarted,
        }
    }

    /// Whether the step can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

/// Lifecycle status of an agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The agent loop is running.
    #[default]
    Running,
    /// The agent finished the step.
    Finished,
    /// The agent failed the step.
    Failed,
    /// The agent was interrupted.
    Interrupted,
}

impl ExecutionStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
        }
    }

    /// Parse from the persisted string form. Unknown values map to
    /// `Running`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "FINISHED" => Self::Finished,
            "FAILED" => Self::Failed,
            "INTERRUPTED" => Self::Interrupted,
            _ => Self::Running,
        }
    }
}

/// One item in a plan's ordered step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step id.
    pub step_id: String,
    /// 0-based position in the plan.
    pub step_index: usize,
    /// Free-text requirement, optionally starting with an `[AGENT_TAG]`.
    pub step_requirement: String,
    /// Name of the agent assigned to the step, once selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Final result, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Proximate cause when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Step {
    /// Create a new step with the given requirement; the id may be filled
    /// in later by the executor.
    #[must_use]
    pub fn new(step_index: usize, step_requirement: impl Into<String>) -> Self {
        Self {
            step_id: String::new(),
            step_index,
            step_requirement: step_requirement.into(),
            agent_name: None,
            status: StepStatus::NotStarted,
            result: None,
            error_message: None,
        }
    }
}

/// User-visible unit of work: a root plan or a sub-plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan id.
    pub current_plan_id: String,
    /// Root of the ancestor chain; equals `current_plan_id` for roots.
    pub root_plan_id: String,
    /// Parent plan id; set iff `tool_call_id` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<String>,
    /// Tool call that spawned this plan; set iff this is a sub-plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Short human-readable title.
    pub title: String,
    /// The request that produced this plan.
    pub user_request: String,
    /// Model used for this plan, if pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Closing summary, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Final result, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Whether the plan has terminated (successfully or not).
    pub completed: bool,
    /// Millis since epoch when execution started.
    pub start_time: i64,
    /// Millis since epoch when execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Index of the step currently (or last) being executed.
    pub current_step_index: usize,
    /// Ordered steps.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Create a root plan.
    #[must_use]
    pub fn new(
        current_plan_id: impl Into<String>,
        title: impl Into<String>,
        user_request: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        let current_plan_id = current_plan_id.into();
        Self {
            root_plan_id: current_plan_id.clone(),
            current_plan_id,
            parent_plan_id: None,
            tool_call_id: None,
            title: title.into(),
            user_request: user_request.into(),
            model_name: None,
            summary: None,
            result: None,
            completed: false,
            start_time: now_millis(),
            end_time: None,
            current_step_index: 0,
            steps,
        }
    }

    /// Link this plan as a sub-plan of `parent_plan_id`, spawned by
    /// `tool_call_id` under `root_plan_id`.
    #[must_use]
    pub fn as_subplan(
        mut self,
        root_plan_id: impl Into<String>,
        parent_plan_id: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        self.root_plan_id = root_plan_id.into();
        self.parent_plan_id = Some(parent_plan_id.into());
        self.tool_call_id = Some(tool_call_id.into());
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Whether this plan was spawned by a tool call.
    #[must_use]
    pub const fn is_subplan(&self) -> bool {
        self.tool_call_id.is_some()
    }
}

/// One tool invocation within an act phase.
///
/// Written in two phases: name/parameters before execution with a null
/// result, the result after execution. Readers must tolerate the window
/// in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActToolInfo {
    /// System-unique tool call id.
    pub tool_call_id: String,
    /// Qualified tool name.
    pub name: String,
    /// JSON arguments string.
    pub parameters: String,
    /// JSON result string, set once execution completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ActToolInfo {
    /// Create a pre-execution entry with a null result.
    #[must_use]
    pub fn new(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        parameters: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            parameters: parameters.into(),
            result: None,
        }
    }
}

/// One think→act iteration inside an agent execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkActRecord {
    /// Database id, assigned on insert.
    pub id: i64,
    /// Owning agent execution record.
    pub parent_execution_id: i64,
    /// Dispatcher-issued `thinkact-` id.
    pub think_act_id: String,
    /// Prompt summary fed to the model.
    pub think_input: String,
    /// Model output text (and tool call digest).
    pub think_output: String,
    /// Character count of the prompt.
    pub input_char_count: usize,
    /// Character count of the response text.
    pub output_char_count: usize,
    /// Error recorded for this cycle, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Whether the think phase produced tool calls to act on.
    pub action_needed: bool,
    /// Combined observation text after the act phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_result: Option<String>,
    /// Millis when the think phase started.
    pub think_start_time: i64,
    /// Millis when the think phase ended.
    pub think_end_time: i64,
    /// Millis when the act phase started.
    pub act_start_time: i64,
    /// Millis when the act phase ended.
    pub act_end_time: i64,
    /// Tool invocations of the act phase, in dispatch order.
    pub act_tool_info_list: Vec<ActToolInfo>,
}

/// One execution of one agent on one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentExecutionRecord {
    /// Database id, assigned on insert.
    pub id: i64,
    /// Step this execution belongs to.
    pub step_id: String,
    /// Conversation id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Name of the executing agent.
    pub agent_name: String,
    /// Agent profile description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<String>,
    /// The step requirement handed to the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_request: Option<String>,
    /// Final result of the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error that ended the execution, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Millis when the execution started.
    pub start_time: i64,
    /// Millis when the execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Maximum think-act rounds allowed.
    pub max_steps: usize,
    /// Rounds consumed so far.
    pub current_step: usize,
    /// Model used, if pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Ordered think-act cycles.
    pub think_act_steps: Vec<ThinkActRecord>,
}

impl AgentExecutionRecord {
    /// Create a running record for a step.
    #[must_use]
    pub fn start(step_id: impl Into<String>, agent_name: impl Into<String>, max_steps: usize) -> Self {
        Self {
            step_id: step_id.into(),
            agent_name: agent_name.into(),
            status: ExecutionStatus::Running,
            start_time: now_millis(),
            max_steps,
            ..Self::default()
        }
    }
}
