//! Parallel and sequential tool dispatch.
//!
//! The dispatcher turns a batch of tool invocation requests into an
//! ordered list of outcomes. Each invocation gets a child [`ToolContext`]
//! seeded from the parent with its own tool-call id and runs as a task on
//! the next depth's worker pool, so an agent's tool calls never compete
//! with the agent itself for slots. Output order always matches input
//! order regardless of completion order; tool side effects are not
//! ordered in the parallel variant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info_span, warn};

use crate::context::ToolContext;
use crate::id::Ids;
use crate::interrupt::InterruptionManager;
use crate::pool::DepthPools;
use crate::tool::{Tool, ToolError, ToolRegistry};

/// One tool invocation request within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelExecutionRequest {
    /// Qualified tool name.
    pub tool_name: String,
    /// JSON arguments string.
    pub params: String,
    /// System tool-call id; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ParallelExecutionRequest {
    /// Create a request without a preassigned tool-call id.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            params: params.into(),
            tool_call_id: None,
        }
    }

    /// Preassign the tool-call id.
    #[must_use]
    pub fn with_tool_call_id(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self
    }
}

/// Terminal status of one dispatched invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    /// The tool ran and returned output.
    Success,
    /// The tool failed or could not be resolved.
    Error,
    /// The invocation was abandoned due to plan interruption.
    Interrupted,
}

impl DispatchStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Interrupted => "INTERRUPTED",
        }
    }
}

/// Outcome of one invocation, positioned by `index` to match the request
/// list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Position in the request batch.
    pub index: usize,
    /// System tool-call id of this invocation.
    pub tool_call_id: String,
    /// Qualified tool name.
    pub tool_name: String,
    /// Terminal status.
    pub status: DispatchStatus,
    /// Tool output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn success(index: usize, tool_call_id: String, tool_name: String, output: String) -> Self {
        Self {
            index,
            tool_call_id,
            tool_name,
            status: DispatchStatus::Success,
            output: Some(output),
            error: None,
        }
    }

    fn error(index: usize, tool_call_id: String, tool_name: String, error: String) -> Self {
        Self {
            index,
            tool_call_id,
            tool_name,
            status: DispatchStatus::Error,
            output: None,
            error: Some(error),
        }
    }

    fn interrupted(index: usize, tool_call_id: String, tool_name: String) -> Self {
        Self {
            index,
            tool_call_id,
            tool_name,
            status: DispatchStatus::Interrupted,
            output: None,
            error: None,
        }
    }

    /// The observation text handed back to the model.
    #[must_use]
    pub fn observation(&self) -> String {
        match self.status {
            DispatchStatus::Success => self.output.clone().unwrap_or_default(),
            DispatchStatus::Error => format!(
                "Tool error: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            DispatchStatus::Interrupted => "Tool execution interrupted".to_owned(),
        }
    }
}

/// Dispatches tool invocation batches onto depth pools.
#[derive(Debug, Clone)]
pub struct ParallelExecutionService {
    pools: Arc<DepthPools>,
    interrupter: Arc<InterruptionManager>,
}

impl ParallelExecutionService {
    /// Create a dispatcher over the given pools and interruption manager.
    #[must_use]
    pub fn new(pools: Arc<DepthPools>, interrupter: Arc<InterruptionManager>) -> Self {
        Self { pools, interrupter }
    }

    /// Dispatch all requests concurrently.
    ///
    /// Invocations run on the pool one level below the caller's depth.
    /// The returned list is ordered by request index.
    pub async fn dispatch_parallel(
        &self,
        requests: Vec<ParallelExecutionRequest>,
        registry: &ToolRegistry,
        parent: &ToolContext,
    ) -> Vec<ExecutionOutcome> {
        let parallel_id = Ids::new_parallel_exec_id();
        let span = info_span!("parallel_dispatch", %parallel_id, batch = requests.len());

        async {
            let mut pending = Vec::with_capacity(requests.len());
            let mut outcomes: Vec<ExecutionOutcome> = Vec::with_capacity(requests.len());

            for (index, request) in requests.into_iter().enumerate() {
                match self.launch(index, request, registry, parent).await {
                    Launched::Handle(task) => pending.push(task),
                    Launched::Immediate(outcome) => outcomes.push(outcome),
                }
            }

            for task in pending {
                outcomes.push(task.resolve().await);
            }

            outcomes.sort_by_key(|o| o.index);
            outcomes
        }
        .instrument(span)
        .await
    }

    /// Dispatch requests one at a time, awaiting each before the next.
    ///
    /// Used when a request in the batch binds to a tool requiring
    /// exclusive interaction, such as the form-input tool.
    pub async fn dispatch_sequential(
        &self,
        requests: Vec<ParallelExecutionRequest>,
        registry: &ToolRegistry,
        parent: &ToolContext,
    ) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            let outcome = match self.launch(index, request, registry, parent).await {
                Launched::Handle(task) => task.resolve().await,
                Launched::Immediate(outcome) => outcome,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn launch(
        &self,
        index: usize,
        request: ParallelExecutionRequest,
        registry: &ToolRegistry,
        parent: &ToolContext,
    ) -> Launched {
        let tool_call_id = request
            .tool_call_id
            .unwrap_or_else(Ids::new_tool_call_id);
        let tool_name = request.tool_name;

        if !self.interrupter.should_continue(&parent.root_plan_id) {
            return Launched::Immediate(ExecutionOutcome::interrupted(
                index,
                tool_call_id,
                tool_name,
            ));
        }

        let Some(tool) = registry.get(&tool_name) else {
            warn!(tool = %tool_name, "Tool not found");
            return Launched::Immediate(ExecutionOutcome::error(
                index,
                tool_call_id,
                tool_name.clone(),
                ToolError::NotFound(tool_name).to_string(),
            ));
        };

        let ctx = parent.with_tool_call_id(tool_call_id.clone());
        let params = request.params;
        let task_name = tool_name.clone();
        // Tool tasks step to the next depth's pool; sharing the caller's
        // pool could deadlock a full recursion level.
        let submitted = self
            .pools
            .submit(parent.plan_depth + 1, async move {
                invoke_tool(index, tool, &task_name, &params, &ctx).await
            })
            .await;

        match submitted {
            Ok(handle) => Launched::Handle(PendingOutcome {
                index,
                tool_call_id,
                tool_name,
                handle,
            }),
            Err(pool_error) => Launched::Immediate(ExecutionOutcome::error(
                index,
                tool_call_id,
                tool_name,
                pool_error.to_string(),
            )),
        }
    }
}

/// An in-flight invocation plus the identity needed to synthesize its
/// outcome if the task dies before producing one.
struct PendingOutcome {
    index: usize,
    tool_call_id: String,
    tool_name: String,
    handle: tokio::task::JoinHandle<ExecutionOutcome>,
}

impl PendingOutcome {
    /// Await the task; a panicked or cancelled task becomes an `ERROR`
    /// outcome at its original index so the batch stays complete.
    async fn resolve(self) -> ExecutionOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                warn!(
                    tool = %self.tool_name,
                    error = %join_error,
                    "Dispatched tool task failed to join"
                );
                ExecutionOutcome::error(
                    self.index,
                    self.tool_call_id,
                    self.tool_name,
                    join_error.to_string(),
                )
            }
        }
    }
}

enum Launched {
    Handle(PendingOutcome),
    Immediate(ExecutionOutcome),
}

async fn invoke_tool(
    index: usize,
    tool: Arc<dyn Tool>,
    tool_name: &str,
    params: &str,
    ctx: &ToolContext,
) -> ExecutionOutcome {
    let span = info_span!(
        "tool",
        tool.name = %tool_name,
        tool.call_id = %ctx.tool_call_id,
        plan.depth = ctx.plan_depth,
    );

    async {
        debug!(tool = %tool_name, "Invoking tool");
        match tool.execute(params, ctx).await {
            Ok(result) => ExecutionOutcome::success(
                index,
                ctx.tool_call_id.clone(),
                tool_name.to_owned(),
                result.output,
            ),
            Err(ToolError::Interrupted) => {
                ExecutionOutcome::interrupted(index, ctx.tool_call_id.clone(), tool_name.to_owned())
            }
            Err(error) => {
                warn!(tool = %tool_name, %error, "Tool execution failed");
                ExecutionOutcome::error(
                    index,
                    ctx.tool_call_id.clone(),
                    tool_name.to_owned(),
                    error.to_string(),
                )
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::context::ExecutionContext;
    use crate::pool::DepthOverflowPolicy;
    use crate::tool::{ToolExecuteResult, parse_arguments};

    struct SleepyEchoTool;

    #[derive(serde::Deserialize)]
    struct SleepyArgs {
        text: String,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        fail: bool,
    }

    #[async_trait]
    impl Tool for SleepyEchoTool {
        fn name(&self) -> &str {
            "test-sleepy_echo"
        }
        fn description(&self) -> String {
            "Echoes after an optional delay.".to_owned()
        }
        fn parameters_schema(&self) -> String {
            "{}".to_owned()
        }
        async fn execute(
            &self,
            arguments: &str,
            _ctx: &ToolContext,
        ) -> Result<ToolExecuteResult, ToolError> {
            let args: SleepyArgs = parse_arguments(arguments)?;
            if args.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
            }
            if args.fail {
                return Err(ToolError::execution("test-sleepy_echo", "asked to fail"));
            }
            Ok(ToolExecuteResult::new(args.text))
        }
    }

    /// Panics mid-execution; its task dies without producing an outcome.
    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "test-panic"
        }
        fn description(&self) -> String {
            "Always panics.".to_owned()
        }
        fn parameters_schema(&self) -> String {
            "{}".to_owned()
        }
        async fn execute(
            &self,
            _arguments: &str,
            _ctx: &ToolContext,
        ) -> Result<ToolExecuteResult, ToolError> {
            panic!("tool exploded");
        }
    }

    fn harness() -> (ParallelExecutionService, ToolRegistry, ToolContext) {
        let pools = Arc::new(DepthPools::new(&[4, 4, 4], DepthOverflowPolicy::ReuseDeepest));
        let interrupter = Arc::new(InterruptionManager::new());
        let service = ParallelExecutionService::new(pools, interrupter);

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SleepyEchoTool));
        registry.register(Arc::new(PanicTool));

        let plan = ExecutionContext::root("plan-1", "req");
        let ctx = ToolContext::for_call(&plan, "toolcall-root");
        (service, registry, ctx)
    }

    #[tokio::test]
    async fn results_match_input_order_despite_completion_order() {
        let (service, registry, ctx) = harness();

        // The first request sleeps longest, so it completes last.
        let requests = vec![
            ParallelExecutionRequest::new(
                "test-sleepy_echo",
                r#"{"text":"slow","delay_ms":120}"#,
            ),
            ParallelExecutionRequest::new(
                "test-sleepy_echo",
                r#"{"text":"medium","delay_ms":40}"#,
            ),
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"fast"}"#),
        ];

        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;
        assert_eq!(outcomes.len(), 3);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
        }
        assert_eq!(outcomes[0].output.as_deref(), Some("slow"));
        assert_eq!(outcomes[2].output.as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn errors_are_captured_per_invocation() {
        let (service, registry, ctx) = harness();
        let requests = vec![
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"ok"}"#),
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"x","fail":true}"#),
        ];

        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;
        assert_eq!(outcomes[0].status, DispatchStatus::Success);
        assert_eq!(outcomes[1].status, DispatchStatus::Error);
        assert!(outcomes[1].error.as_ref().unwrap().contains("asked to fail"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let (service, registry, ctx) = harness();
        let requests = vec![ParallelExecutionRequest::new("test-missing", "{}")];
        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;
        assert_eq!(outcomes[0].status, DispatchStatus::Error);
        assert!(outcomes[0].error.as_ref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn preassigned_tool_call_ids_are_kept() {
        let (service, registry, ctx) = harness();
        let requests = vec![
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"a"}"#)
                .with_tool_call_id("toolcall-fixed"),
        ];
        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;
        assert_eq!(outcomes[0].tool_call_id, "toolcall-fixed");
    }

    #[tokio::test]
    async fn interrupted_root_skips_launches() {
        let (service, registry, ctx) = harness();
        service.interrupter.register("plan-1");
        service.interrupter.request("plan-1");

        let requests = vec![ParallelExecutionRequest::new(
            "test-sleepy_echo",
            r#"{"text":"never"}"#,
        )];
        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;
        assert_eq!(outcomes[0].status, DispatchStatus::Interrupted);
    }

    #[tokio::test]
    async fn panicked_task_becomes_an_error_outcome_at_its_index() {
        let (service, registry, ctx) = harness();
        let requests = vec![
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"before"}"#),
            ParallelExecutionRequest::new("test-panic", "{}").with_tool_call_id("toolcall-boom"),
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"after"}"#),
        ];

        let outcomes = service.dispatch_parallel(requests, &registry, &ctx).await;

        // One outcome per request, indices intact.
        assert_eq!(outcomes.len(), 3);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
        }
        assert_eq!(outcomes[0].output.as_deref(), Some("before"));
        assert_eq!(outcomes[1].status, DispatchStatus::Error);
        assert_eq!(outcomes[1].tool_call_id, "toolcall-boom");
        assert!(outcomes[1].error.as_ref().unwrap().contains("panic"));
        assert_eq!(outcomes[2].output.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn sequential_panic_keeps_the_batch_complete() {
        let (service, registry, ctx) = harness();
        let requests = vec![
            ParallelExecutionRequest::new("test-panic", "{}"),
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"still runs"}"#),
        ];

        let outcomes = service.dispatch_sequential(requests, &registry, &ctx).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].index, 0);
        assert_eq!(outcomes[0].status, DispatchStatus::Error);
        assert_eq!(outcomes[1].index, 1);
        assert_eq!(outcomes[1].output.as_deref(), Some("still runs"));
    }

    #[tokio::test]
    async fn sequential_preserves_order() {
        let (service, registry, ctx) = harness();
        let requests = vec![
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"one"}"#),
            ParallelExecutionRequest::new("test-sleepy_echo", r#"{"text":"two"}"#),
        ];
        let outcomes = service.dispatch_sequential(requests, &registry, &ctx).await;
        assert_eq!(outcomes[0].output.as_deref(), Some("one"));
        assert_eq!(outcomes[1].output.as_deref(), Some("two"));
    }
}
