//! Execution and tool contexts.
//!
//! Identity travels explicitly: the plan executor hands an
//! [`ExecutionContext`] to agents, and the dispatcher derives a
//! [`ToolContext`] per invocation. No ambient global state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-plan identity handed to the executor and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Id of the plan being executed.
    pub current_plan_id: String,
    /// Root of the plan tree; equals `current_plan_id` for root plans.
    pub root_plan_id: String,
    /// Parent plan id, set iff this is a sub-plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<String>,
    /// Tool call that spawned this plan, set iff this is a sub-plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Conversation id for cross-step memory, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Distance from the root plan; selects the worker pool.
    pub plan_depth: usize,
    /// The original user request driving this plan.
    pub user_request: String,
    /// Upload staging key for pre-uploaded files, root plans only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_key: Option<String>,
}

impl ExecutionContext {
    /// Context for a root plan.
    #[must_use]
    pub fn root(plan_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        let plan_id = plan_id.into();
        Self {
            current_plan_id: plan_id.clone(),
            root_plan_id: plan_id,
            parent_plan_id: None,
            tool_call_id: None,
            conversation_id: None,
            plan_depth: 0,
            user_request: user_request.into(),
            upload_key: None,
        }
    }

    /// Context for a sub-plan spawned by a tool call of this plan.
    #[must_use]
    pub fn subplan(
        &self,
        sub_plan_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        user_request: impl Into<String>,
    ) -> Self {
        Self {
            current_plan_id: sub_plan_id.into(),
            root_plan_id: self.root_plan_id.clone(),
            parent_plan_id: Some(self.current_plan_id.clone()),
            tool_call_id: Some(tool_call_id.into()),
            conversation_id: self.conversation_id.clone(),
            plan_depth: self.plan_depth + 1,
            user_request: user_request.into(),
            upload_key: None,
        }
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Set the upload staging key.
    #[must_use]
    pub fn with_upload_key(mut self, upload_key: impl Into<String>) -> Self {
        self.upload_key = Some(upload_key.into());
        self
    }

    /// Whether this context describes a sub-plan.
    #[must_use]
    pub const fn is_subplan(&self) -> bool {
        self.parent_plan_id.is_some()
    }
}

/// Per-invocation identity handed to tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    /// System-unique id of this tool invocation.
    pub tool_call_id: String,
    /// Depth of the calling plan.
    pub plan_depth: usize,
    /// Id of the calling plan.
    pub current_plan_id: String,
    /// Root of the calling plan tree.
    pub root_plan_id: String,
    /// Additional key-value context for tool-specific needs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ToolContext {
    /// Build a tool context from the plan context and a tool call id.
    #[must_use]
    pub fn for_call(execution: &ExecutionContext, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            plan_depth: execution.plan_depth,
            current_plan_id: execution.current_plan_id.clone(),
            root_plan_id: execution.root_plan_id.clone(),
            extra: BTreeMap::new(),
        }
    }

    /// Derive a context for another call within the same plan.
    #[must_use]
    pub fn with_tool_call_id(&self, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            plan_depth: self.plan_depth,
            current_plan_id: self.current_plan_id.clone(),
            root_plan_id: self.root_plan_id.clone(),
            extra: self.extra.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn root_context_points_to_itself() {
        let ctx = ExecutionContext::root("plan-1", "do things");
        assert_eq!(ctx.current_plan_id, "plan-1");
        assert_eq!(ctx.root_plan_id, "plan-1");
        assert_eq!(ctx.plan_depth, 0);
        assert!(!ctx.is_subplan());
    }

    #[test]
    fn subplan_context_links_parent_and_tool_call() {
        let root = ExecutionContext::root("plan-1", "outer");
        let sub = root.subplan("plan-2", "toolcall-42", "inner");
        assert_eq!(sub.current_plan_id, "plan-2");
        assert_eq!(sub.root_plan_id, "plan-1");
        assert_eq!(sub.parent_plan_id.as_deref(), Some("plan-1"));
        assert_eq!(sub.tool_call_id.as_deref(), Some("toolcall-42"));
        assert_eq!(sub.plan_depth, 1);
        assert!(sub.is_subplan());
    }

    #[test]
    fn tool_context_carries_identity() {
        let plan = ExecutionContext::root("plan-1", "req");
        let ctx = ToolContext::for_call(&plan, "toolcall-7");
        assert_eq!(ctx.tool_call_id, "toolcall-7");
        assert_eq!(ctx.plan_depth, 0);
        assert_eq!(ctx.root_plan_id, "plan-1");

        let sibling = ctx.with_tool_call_id("toolcall-8");
        assert_eq!(sibling.tool_call_id, "toolcall-8");
        assert_eq!(sibling.current_plan_id, "plan-1");
    }
}
