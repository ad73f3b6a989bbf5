//! Sub-plan tool: a tool call that runs a whole plan.
//!
//! Re-enters the plan executor one depth level down, linking the new plan
//! to the spawning call by `tool_call_id`. The sub-plan's final result
//! string is the tool output; a failed sub-plan surfaces as a tool error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::SUBPLAN_TOOL;
use crate::context::{ExecutionContext, ToolContext};
use crate::error::EngineError;
use crate::executor::PlanExecutor;
use crate::id::Ids;
use crate::record::{Plan, Step, StepStatus};
use crate::tool::{Tool, ToolError, ToolExecuteResult, parse_arguments};

/// Spawns and awaits a nested plan.
pub struct SubplanTool {
    executor: Arc<PlanExecutor>,
}

impl std::fmt::Debug for SubplanTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubplanTool").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SubplanArgs {
    title: String,
    user_request: String,
    steps: Vec<String>,
}

impl SubplanTool {
    /// Create the tool over the shared executor.
    #[must_use]
    pub fn new(executor: Arc<PlanExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for SubplanTool {
    fn name(&self) -> &str {
        SUBPLAN_TOOL
    }

    fn description(&self) -> String {
        "Delegate a multi-step task to a nested plan. Provide the task \
         description and an ordered list of step requirements; returns the \
         nested plan's final result."
            .to_owned()
    }

    fn parameters_schema(&self) -> String {
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short title for the nested plan"
                },
                "user_request": {
                    "type": "string",
                    "description": "Overall task the nested plan fulfills"
                },
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Ordered step requirements"
                }
            },
            "required": ["title", "user_request", "steps"]
        })
        .to_string()
    }

    async fn execute(
        &self,
        arguments: &str,
        ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError> {
        let args: SubplanArgs = parse_arguments(arguments)?;
        if args.steps.is_empty() {
            return Err(ToolError::InvalidArguments(
                "a sub-plan needs at least one step".to_owned(),
            ));
        }

        let sub_ctx = ExecutionContext {
            current_plan_id: Ids::new_plan_id(),
            root_plan_id: ctx.root_plan_id.clone(),
            parent_plan_id: Some(ctx.current_plan_id.clone()),
            tool_call_id: Some(ctx.tool_call_id.clone()),
            conversation_id: None,
            plan_depth: ctx.plan_depth + 1,
            user_request: args.user_request.clone(),
            upload_key: None,
        };

        let steps = args
            .steps
            .iter()
            .enumerate()
            .map(|(index, requirement)| Step::new(index, requirement))
            .collect();
        let plan = Plan::new(
            &sub_ctx.current_plan_id,
            args.title,
            args.user_request,
            steps,
        )
        .as_subplan(
            &ctx.root_plan_id,
            &ctx.current_plan_id,
            &ctx.tool_call_id,
        );

        info!(
            sub_plan_id = %sub_ctx.current_plan_id,
            parent_plan_id = %ctx.current_plan_id,
            depth = sub_ctx.plan_depth,
            "Spawning sub-plan"
        );

        match self.executor.execute_plan(plan, sub_ctx).await {
            Ok(plan) => subplan_verdict(&plan),
            Err(EngineError::Interrupted) => Err(ToolError::Interrupted),
            Err(infra) => Err(ToolError::execution(SUBPLAN_TOOL, infra.to_string())),
        }
    }
}

fn subplan_verdict(plan: &Plan) -> Result<ToolExecuteResult, ToolError> {
    if plan
        .steps
        .iter()
        .any(|s| s.status == StepStatus::Interrupted)
    {
        return Err(ToolError::Interrupted);
    }
    if let Some(failed) = plan.steps.iter().find(|s| s.status == StepStatus::Failed) {
        let message = failed
            .error_message
            .clone()
            .unwrap_or_else(|| format!("sub-plan step {} failed", failed.step_index));
        return Err(ToolError::execution(SUBPLAN_TOOL, message));
    }

    Ok(ToolExecuteResult::new(
        plan.result
            .clone()
            .or_else(|| plan.summary.clone())
            .unwrap_or_default(),
    ))
}
