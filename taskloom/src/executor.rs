//! Plan executor: drives a plan's ordered steps through agents.
//!
//! # Worker placement
//!
//! A root plan's agent work is submitted to the depth-0 pool. Tool
//! invocations always dispatch to the pool one level deeper than their
//! plan, so when a sub-plan tool runs it already occupies a worker of the
//! sub-plan's depth; the sub-plan's agent loop therefore runs inline on
//! that worker. Pool indices form a strictly increasing chain down the
//! plan tree, which is what rules out recursion deadlocks.
//!
//! # Lifecycle
//!
//! Ids and step indices are normalized before recording the plan start;
//! root plans get a working directory with pre-uploaded files synced in.
//! Steps execute strictly in order; a failed or interrupted step stops the
//! plan. Cleanup (tool teardown, wait-registry and interruption-flag
//! removal, workspace unlinking) runs on every exit path.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use tracing::{Instrument, debug, info, info_span, warn};

use crate::agent::{AgentProfile, DynamicAgent, parse_agent_tag};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::dispatch::ParallelExecutionService;
use crate::error::{EngineError, Result};
use crate::id::{Ids, now_millis};
use crate::interrupt::InterruptionManager;
use crate::llm::ChatProvider;
use crate::memory::MemoryLimitService;
use crate::message::ChatMessage;
use crate::pool::DepthPools;
use crate::record::{ExecutionStatus, HierarchyReader, Plan, SqliteRecorder, StepStatus};
use crate::tool::ToolRegistry;
use crate::wait::UserInputWaitRegistry;

enum StepsVerdict {
    Completed,
    Failed(String),
    Interrupted,
}

/// Orchestrates plan execution over the engine's shared services.
pub struct PlanExecutor {
    config: EngineConfig,
    provider: Arc<dyn ChatProvider>,
    recorder: Arc<SqliteRecorder>,
    pools: Arc<DepthPools>,
    interrupter: Arc<InterruptionManager>,
    wait_registry: Arc<UserInputWaitRegistry>,
    profiles: HashMap<String, AgentProfile>,
    default_profile: AgentProfile,
    // Installed once at bootstrap; the registry may include tools that
    // hold an Arc back to this executor (the sub-plan tool).
    tools: OnceLock<Arc<ToolRegistry>>,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field("default_profile", &self.default_profile.name)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Create an executor over a provider and recorder.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn ChatProvider>,
        recorder: Arc<SqliteRecorder>,
    ) -> Self {
        let pools = Arc::new(DepthPools::new(&config.pool_sizes, config.depth_overflow));
        let wait_registry = Arc::new(UserInputWaitRegistry::new(config.form_lock_timeout()));
        let default_profile = AgentProfile::new(
            "DEFAULT_AGENT",
            "General-purpose step executor",
            "You are a capable assistant executing one step of a plan. Use \
             the available tools to fulfill the step requirement, then call \
             the terminate tool with the final result.",
        );
        Self {
            config,
            provider,
            recorder,
            pools,
            interrupter: Arc::new(InterruptionManager::new()),
            wait_registry,
            profiles: HashMap::new(),
            default_profile,
            tools: OnceLock::new(),
        }
    }

    /// Register an agent profile selectable via `[AGENT_TAG]` prefixes.
    #[must_use]
    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }

    /// Replace the default agent profile.
    #[must_use]
    pub fn with_default_profile(mut self, profile: AgentProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Install the tool callback map. Bootstrap-only: fails when called
    /// twice.
    pub fn install_tools(&self, tools: Arc<ToolRegistry>) -> Result<()> {
        self.tools
            .set(tools)
            .map_err(|_| EngineError::configuration("tool registry already installed"))
    }

    /// The engine's interruption manager, for cancellation endpoints.
    #[must_use]
    pub fn interrupter(&self) -> Arc<InterruptionManager> {
        Arc::clone(&self.interrupter)
    }

    /// The form-input wait registry, for submission endpoints.
    #[must_use]
    pub fn wait_registry(&self) -> Arc<UserInputWaitRegistry> {
        Arc::clone(&self.wait_registry)
    }

    /// The execution recorder.
    #[must_use]
    pub fn recorder(&self) -> Arc<SqliteRecorder> {
        Arc::clone(&self.recorder)
    }

    /// The depth-indexed worker pools.
    #[must_use]
    pub fn pools(&self) -> Arc<DepthPools> {
        Arc::clone(&self.pools)
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A hierarchy reader over this executor's recorder.
    #[must_use]
    pub fn reader(&self) -> HierarchyReader {
        HierarchyReader::new(Arc::clone(&self.recorder))
    }

    /// Execute a root plan built from a user request.
    ///
    /// Generates the plan id when absent and registers the interruption
    /// flag for the new tree. `upload_key` selects pre-uploaded files to
    /// sync into the run directory.
    pub async fn execute_root(
        self: &Arc<Self>,
        mut plan: Plan,
        upload_key: Option<String>,
    ) -> Result<Plan> {
        if plan.current_plan_id.is_empty() {
            plan.current_plan_id = Ids::new_plan_id();
        }
        plan.root_plan_id = plan.current_plan_id.clone();
        let mut ctx = ExecutionContext::root(&plan.current_plan_id, &plan.user_request);
        ctx.upload_key = upload_key;
        self.execute_plan(plan, ctx).await
    }

    /// Execute a plan under the given context; re-entered by the sub-plan
    /// tool with `depth + 1`.
    ///
    /// Business failures (failed or interrupted steps) are encoded in the
    /// returned [`Plan`]; `Err` is reserved for infrastructure problems.
    pub fn execute_plan(
        self: &Arc<Self>,
        plan: Plan,
        ctx: ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Plan>> + Send>> {
        let this = Arc::clone(self);
        let span = info_span!(
            "plan",
            plan.id = %ctx.current_plan_id,
            plan.root = %ctx.root_plan_id,
            plan.depth = ctx.plan_depth,
        );
        Box::pin(async move { this.execute_inner(plan, ctx).instrument(span).await })
    }

    async fn execute_inner(self: Arc<Self>, mut plan: Plan, ctx: ExecutionContext) -> Result<Plan> {
        // Normalize identity: the context is authoritative.
        plan.current_plan_id = ctx.current_plan_id.clone();
        plan.root_plan_id = ctx.root_plan_id.clone();
        plan.parent_plan_id = ctx.parent_plan_id.clone();
        plan.tool_call_id = ctx.tool_call_id.clone();
        for (index, step) in plan.steps.iter_mut().enumerate() {
            step.step_index = index;
            if step.step_id.is_empty() {
                step.step_id = Ids::new_step_id();
            }
        }

        let is_root = !ctx.is_subplan();
        if is_root {
            self.interrupter.register(&ctx.root_plan_id);
        }

        info!(
            title = %plan.title,
            steps = plan.steps.len(),
            "Plan execution started"
        );
        self.recorder.record_plan_start(&plan).await?;
        if is_root {
            self.prepare_workspace(&plan, &ctx);
        }

        let verdict = self.drive_steps(&mut plan, &ctx).await;

        plan.completed = true;
        plan.end_time = Some(now_millis());
        plan.result = plan.steps.iter().rev().find_map(|s| s.result.clone());
        plan.summary = match &verdict {
            Ok(StepsVerdict::Completed) => plan.result.clone(),
            Ok(StepsVerdict::Failed(message)) => Some(format!("Plan failed: {message}")),
            Ok(StepsVerdict::Interrupted) => Some("Plan interrupted".to_owned()),
            Err(infra) => Some(format!("Plan aborted: {infra}")),
        };
        if let Err(e) = self.recorder.record_plan_complete(&plan).await {
            warn!(error = %e, "Failed to record plan completion");
        }

        self.perform_cleanup(&plan, &ctx, is_root).await;

        verdict?;
        info!(completed = plan.completed, "Plan execution ended");
        Ok(plan)
    }

    async fn drive_steps(
        &self,
        plan: &mut Plan,
        ctx: &ExecutionContext,
    ) -> Result<StepsVerdict> {
        let mut conversation: Vec<ChatMessage> = Vec::new();

        for index in 0..plan.steps.len() {
            if !self.interrupter.should_continue(&ctx.root_plan_id) {
                let step = &mut plan.steps[index];
                step.status = StepStatus::Interrupted;
                self.recorder
                    .record_step_end(step, &plan.current_plan_id)
                    .await?;
                return Ok(StepsVerdict::Interrupted);
            }

            plan.current_step_index = index;
            let profile = self.select_profile(&plan.steps[index].step_requirement);

            let mut step = plan.steps[index].clone();
            step.agent_name = Some(profile.name.clone());
            step.status = StepStatus::InProgress;
            self.recorder
                .record_step_start(&step, &plan.current_plan_id)
                .await?;
            debug!(step = index, agent = %profile.name, "Step started");

            let agent = self.build_agent(profile, plan.model_name.as_deref());
            let (mut step, outcome) = if ctx.plan_depth == 0 {
                // Root plans borrow a depth-0 worker for the agent loop.
                let step_ctx = ctx.clone();
                let conv = conversation.clone();
                let handle = self
                    .pools
                    .submit(0, async move {
                        let mut step = step;
                        let outcome = agent.execute_step(&step_ctx, &mut step, &conv).await;
                        (step, outcome)
                    })
                    .await?;
                handle
                    .await
                    .map_err(|e| EngineError::internal(format!("agent task failed: {e}")))?
            } else {
                // Sub-plans already occupy a worker of their depth (the
                // sub-plan tool's task); run the agent loop inline.
                let outcome = agent.execute_step(ctx, &mut step, &conversation).await;
                (step, outcome)
            };

            step.status = match outcome.status {
                ExecutionStatus::Finished => StepStatus::Completed,
                ExecutionStatus::Interrupted => StepStatus::Interrupted,
                ExecutionStatus::Running | ExecutionStatus::Failed => StepStatus::Failed,
            };
            self.recorder
                .record_step_end(&step, &plan.current_plan_id)
                .await?;

            conversation.push(ChatMessage::user(format!(
                "Step {index}: {}",
                step.step_requirement
            )));
            if let Some(result) = &step.result {
                conversation.push(ChatMessage::assistant(result));
            }

            plan.steps[index] = step;
            let step = &plan.steps[index];
            match step.status {
                StepStatus::Completed => {}
                StepStatus::Interrupted => return Ok(StepsVerdict::Interrupted),
                _ => {
                    let message = step
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("step {index} failed"));
                    return Ok(StepsVerdict::Failed(message));
                }
            }
        }

        Ok(StepsVerdict::Completed)
    }

    fn select_profile(&self, requirement: &str) -> AgentProfile {
        let (tag, _) = parse_agent_tag(requirement);
        tag.and_then(|t| self.profiles.get(t))
            .unwrap_or(&self.default_profile)
            .clone()
    }

    fn build_agent(&self, profile: AgentProfile, plan_model: Option<&str>) -> DynamicAgent {
        let memory = MemoryLimitService::new(
            Arc::clone(&self.provider),
            self.config.memory_max_characters,
            self.config.memory_retain_recent,
        );
        let dispatcher =
            ParallelExecutionService::new(Arc::clone(&self.pools), Arc::clone(&self.interrupter));
        let model = plan_model.unwrap_or(&self.config.default_model);
        let tools = self
            .tools
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(ToolRegistry::new()));
        DynamicAgent::new(
            profile,
            Arc::clone(&self.provider),
            tools,
            Arc::clone(&self.recorder),
            Arc::clone(&self.interrupter),
            memory,
            dispatcher,
            model,
            self.config.max_agent_steps,
        )
    }

    /// Create the root plan's working directory, link it as the latest
    /// run, and sync pre-uploaded files keyed by the upload key.
    ///
    /// Workspace problems are logged, never fatal: a plan without a
    /// working directory can still run tools that do not touch disk.
    fn prepare_workspace(&self, plan: &Plan, ctx: &ExecutionContext) {
        let run_dir = self.config.base_dir.join(&plan.current_plan_id);
        if let Err(e) = std::fs::create_dir_all(&run_dir) {
            warn!(error = %e, dir = %run_dir.display(), "Failed to create run directory");
            return;
        }

        let link = self.config.base_dir.join("latest");
        let _ = std::fs::remove_file(&link);
        #[cfg(unix)]
        if let Err(e) = std::os::unix::fs::symlink(&run_dir, &link) {
            warn!(error = %e, "Failed to link latest run directory");
        }

        if let Some(upload_key) = &ctx.upload_key {
            let staging = self.config.upload_dir.join(upload_key);
            match std::fs::read_dir(&staging) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let target = run_dir.join(entry.file_name());
                        if let Err(e) = std::fs::copy(entry.path(), &target) {
                            warn!(error = %e, file = %entry.path().display(), "Failed to sync uploaded file");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, key = %upload_key, "No staged uploads found");
                }
            }
        }
    }

    async fn perform_cleanup(&self, plan: &Plan, ctx: &ExecutionContext, is_root: bool) {
        if let Some(tools) = self.tools.get() {
            tools.cleanup_all(&plan.current_plan_id).await;
        }

        if is_root {
            self.wait_registry.remove(&ctx.root_plan_id).await;
            self.interrupter.terminate(&ctx.root_plan_id);
            self.interrupter.remove(&ctx.root_plan_id);

            // Remove the latest-run symlink when it points at this plan.
            let link = self.config.base_dir.join("latest");
            if std::fs::read_link(&link)
                .is_ok_and(|target| target.ends_with(&plan.current_plan_id))
            {
                let _ = std::fs::remove_file(&link);
            }
        }
        debug!(plan_id = %plan.current_plan_id, "Plan cleanup finished");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::llm::{ChatRequest, ChunkStream, LlmError};
    use crate::record::Step;

    /// Provider that refuses every call; enough for non-LLM paths.
    struct SilentProvider;

    #[async_trait]
    impl ChatProvider for SilentProvider {
        async fn chat_stream(&self, _request: &ChatRequest) -> std::result::Result<ChunkStream, LlmError> {
            Err(LlmError::provider("no model configured"))
        }
        fn provider_name(&self) -> &'static str {
            "silent"
        }
        fn default_model(&self) -> &str {
            "silent-model"
        }
    }

    fn silent_provider() -> Arc<dyn ChatProvider> {
        Arc::new(SilentProvider)
    }

    #[test]
    fn profile_selection_prefers_tag() {
        let provider = silent_provider();
        let recorder = Arc::new(SqliteRecorder::in_memory().unwrap());
        let executor = PlanExecutor::new(EngineConfig::default(), provider, recorder)
            .with_profile(AgentProfile::new("BROWSER", "browser work", "prompt"));

        assert_eq!(executor.select_profile("[BROWSER] open page").name, "BROWSER");
        assert_eq!(executor.select_profile("[UNKNOWN] x").name, "DEFAULT_AGENT");
        assert_eq!(executor.select_profile("plain step").name, "DEFAULT_AGENT");
    }

    #[test]
    fn tools_install_is_bootstrap_only() {
        let provider = silent_provider();
        let recorder = Arc::new(SqliteRecorder::in_memory().unwrap());
        let executor = PlanExecutor::new(EngineConfig::default(), provider, recorder);

        executor
            .install_tools(Arc::new(ToolRegistry::new()))
            .unwrap();
        assert!(executor.install_tools(Arc::new(ToolRegistry::new())).is_err());
    }

    #[test]
    fn workspace_is_prepared_and_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(uploads.path().join("key-1")).unwrap();
        std::fs::write(uploads.path().join("key-1/data.txt"), b"payload").unwrap();

        let config = EngineConfig::default()
            .with_base_dir(dir.path())
            .with_upload_dir(uploads.path());
        let provider = silent_provider();
        let recorder = Arc::new(SqliteRecorder::in_memory().unwrap());
        let executor = PlanExecutor::new(config, provider, recorder);

        let plan = Plan::new("plan-ws", "t", "req", vec![Step::new(0, "s")]);
        let ctx = ExecutionContext::root("plan-ws", "req").with_upload_key("key-1");
        executor.prepare_workspace(&plan, &ctx);

        assert!(dir.path().join("plan-ws/data.txt").exists());
        assert!(dir.path().join("latest").exists());
    }
}
