//! On-demand plan tree reconstruction for inspection endpoints.
//!
//! The reader loads every plan sharing a `root_plan_id`, joins sub-plans to
//! their spawning tool calls via `tool_call_id`, and attaches per-step agent
//! summaries with think-act detail stripped. Full detail for one step is a
//! separate read, [`HierarchyReader::agent_execution_detail`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::model::{ActToolInfo, AgentExecutionRecord, ExecutionStatus, Plan, Step};
use super::sqlite::SqliteRecorder;
use super::{RecorderError, RecorderResult};

/// Agent execution summary without think-act detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionSummary {
    /// Database id of the execution.
    pub id: i64,
    /// Step this execution belongs to.
    pub step_id: String,
    /// Name of the executing agent.
    pub agent_name: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Final result, if terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error message, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Millis when the execution started.
    pub start_time: i64,
    /// Millis when the execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Rounds consumed.
    pub current_step: usize,
    /// Maximum rounds allowed.
    pub max_steps: usize,
}

impl From<AgentExecutionRecord> for AgentExecutionSummary {
    fn from(record: AgentExecutionRecord) -> Self {
        Self {
            id: record.id,
            step_id: record.step_id,
            agent_name: record.agent_name,
            status: record.status,
            result: record.result,
            error_message: record.error_message,
            start_time: record.start_time,
            end_time: record.end_time,
            current_step: record.current_step,
            max_steps: record.max_steps,
        }
    }
}

/// View of one plan with its agents and nested sub-plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionView {
    /// Plan id.
    pub current_plan_id: String,
    /// Root of the plan tree.
    pub root_plan_id: String,
    /// Parent plan id for sub-plans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<String>,
    /// Spawning tool call id for sub-plans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Plan title.
    pub title: String,
    /// Originating request.
    pub user_request: String,
    /// Closing summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Final result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Whether the plan has terminated.
    pub completed: bool,
    /// Millis when execution started.
    pub start_time: i64,
    /// Millis when execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Index of the current (or last) step.
    pub current_step_index: usize,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Per-step agent summaries, think-act detail stripped.
    pub agent_executions: Vec<AgentExecutionSummary>,
    /// The tool call that spawned this plan, resolved for sub-plans.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_act_tool_call: Option<ActToolInfo>,
    /// Nested sub-plans.
    pub sub_plans: Vec<PlanExecutionView>,
}

/// Builds plan trees from the recorder's store.
#[derive(Debug, Clone)]
pub struct HierarchyReader {
    recorder: Arc<SqliteRecorder>,
}

impl HierarchyReader {
    /// Create a reader over the given recorder.
    #[must_use]
    pub fn new(recorder: Arc<SqliteRecorder>) -> Self {
        Self { recorder }
    }

    /// Load the plan tree rooted at (or containing) `plan_id`.
    ///
    /// Returns the view for `plan_id` itself with sub-plans nested below
    /// it. Agent summaries carry no think-act detail.
    pub async fn plan_details(&self, plan_id: &str) -> RecorderResult<PlanExecutionView> {
        let plan = self
            .recorder
            .find_plan(plan_id)
            .await?
            .ok_or_else(|| RecorderError::NotFound(format!("plan '{plan_id}'")))?;

        let all = self.recorder.plans_by_root(&plan.root_plan_id).await?;

        // Group children by parent so the tree can be built top-down.
        let mut children: HashMap<String, Vec<Plan>> = HashMap::new();
        let mut target = None;
        for entry in all {
            if entry.current_plan_id == plan_id {
                target = Some(entry.clone());
            }
            if let Some(parent) = entry.parent_plan_id.clone() {
                children.entry(parent).or_default().push(entry);
            }
        }
        let target = target.ok_or_else(|| RecorderError::NotFound(format!("plan '{plan_id}'")))?;

        self.build_view(target, &children).await
    }

    /// Full agent execution detail for one step, including every think-act
    /// cycle and its tool calls.
    pub async fn agent_execution_detail(
        &self,
        step_id: &str,
    ) -> RecorderResult<AgentExecutionRecord> {
        self.recorder.get_agent_execution_detail(step_id).await
    }

    fn build_view<'a>(
        &'a self,
        plan: Plan,
        children: &'a HashMap<String, Vec<Plan>>,
    ) -> futures::future::BoxFuture<'a, RecorderResult<PlanExecutionView>> {
        Box::pin(async move {
            let mut agent_executions = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                if step.step_id.is_empty() {
                    continue;
                }
                if let Some(record) = self.recorder.find_agent_execution(&step.step_id).await? {
                    agent_executions.push(AgentExecutionSummary::from(record));
                }
            }

            let parent_act_tool_call = match &plan.tool_call_id {
                Some(tool_call_id) => {
                    self.recorder.find_act_tool_by_call_id(tool_call_id).await?
                }
                None => None,
            };

            let mut sub_plans = Vec::new();
            if let Some(subs) = children.get(&plan.current_plan_id) {
                for sub in subs {
                    sub_plans.push(self.build_view(sub.clone(), children).await?);
                }
            }

            Ok(PlanExecutionView {
                current_plan_id: plan.current_plan_id,
                root_plan_id: plan.root_plan_id,
                parent_plan_id: plan.parent_plan_id,
                tool_call_id: plan.tool_call_id,
                title: plan.title,
                user_request: plan.user_request,
                summary: plan.summary,
                result: plan.result,
                completed: plan.completed,
                start_time: plan.start_time,
                end_time: plan.end_time,
                current_step_index: plan.current_step_index,
                steps: plan.steps,
                agent_executions,
                parent_act_tool_call,
                sub_plans,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::record::model::{ActToolInfo, ThinkActRecord};

    async fn seeded() -> (Arc<SqliteRecorder>, HierarchyReader) {
        let recorder = Arc::new(SqliteRecorder::in_memory().unwrap());
        let reader = HierarchyReader::new(Arc::clone(&recorder));

        // Root plan with one step whose tool call spawned a sub-plan.
        let mut root = Plan::new("plan-root", "Root", "outer request", vec![Step::new(0, "step")]);
        root.steps[0].step_id = "step-1".to_owned();
        recorder.record_plan_start(&root).await.unwrap();

        let exec = AgentExecutionRecord::start("step-1", "WORKER", 10);
        let exec_id = recorder.record_agent_start(&exec).await.unwrap();

        let cycle = ThinkActRecord {
            parent_execution_id: exec_id,
            think_act_id: "thinkact-1".to_owned(),
            action_needed: true,
            act_tool_info_list: vec![ActToolInfo::new("toolcall-42", "planning-subplan", "{}")],
            ..ThinkActRecord::default()
        };
        recorder.record_think_act(&cycle).await.unwrap();

        let sub = Plan::new("plan-sub", "Sub", "inner request", vec![Step::new(0, "sub step")])
            .as_subplan("plan-root", "plan-root", "toolcall-42");
        recorder.record_plan_start(&sub).await.unwrap();

        (recorder, reader)
    }

    #[tokio::test]
    async fn tree_nests_sub_plans() {
        let (_recorder, reader) = seeded().await;
        let view = reader.plan_details("plan-root").await.unwrap();

        assert_eq!(view.current_plan_id, "plan-root");
        assert_eq!(view.sub_plans.len(), 1);
        assert_eq!(view.sub_plans[0].current_plan_id, "plan-sub");
        assert_eq!(
            view.sub_plans[0].parent_plan_id.as_deref(),
            Some("plan-root")
        );
    }

    #[tokio::test]
    async fn sub_plan_resolves_parent_tool_call() {
        let (_recorder, reader) = seeded().await;
        let view = reader.plan_details("plan-root").await.unwrap();

        let sub = &view.sub_plans[0];
        let parent_call = sub.parent_act_tool_call.as_ref().unwrap();
        assert_eq!(parent_call.tool_call_id, "toolcall-42");
        assert_eq!(parent_call.name, "planning-subplan");
    }

    #[tokio::test]
    async fn agent_summaries_strip_think_act_detail() {
        let (_recorder, reader) = seeded().await;
        let view = reader.plan_details("plan-root").await.unwrap();

        assert_eq!(view.agent_executions.len(), 1);
        assert_eq!(view.agent_executions[0].agent_name, "WORKER");

        // The per-step detail read still returns the full record.
        let detail = reader.agent_execution_detail("step-1").await.unwrap();
        assert_eq!(detail.think_act_steps.len(), 1);
    }

    #[tokio::test]
    async fn sub_plan_view_can_be_requested_directly() {
        let (_recorder, reader) = seeded().await;
        let view = reader.plan_details("plan-sub").await.unwrap();
        assert_eq!(view.current_plan_id, "plan-sub");
        assert!(view.sub_plans.is_empty());
        assert!(view.parent_act_tool_call.is_some());
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let (_recorder, reader) = seeded().await;
        assert!(matches!(
            reader.plan_details("plan-none").await,
            Err(RecorderError::NotFound(_))
        ));
    }
}
