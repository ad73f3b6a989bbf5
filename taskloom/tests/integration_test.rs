//! End-to-end tests for the plan/agent execution engine.
//!
//! A scripted provider feeds predetermined LLM turns to the engine; tools
//! are real registry entries so every scenario exercises the full path:
//! executor → agent → dispatcher → recorder → hierarchy reader.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use taskloom::prelude::*;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

enum ScriptTurn {
    Chunks(Vec<StreamChunk>),
    Fail(LlmError),
}

/// Returns scripted turns in order; records call times and the last user
/// message of every request.
struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptTurn>>,
    call_times: Mutex<Vec<tokio::time::Instant>>,
    last_user_messages: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(turns: Vec<ScriptTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            call_times: Mutex::new(Vec::new()),
            last_user_messages: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.call_times.lock().unwrap().len()
    }

    fn call_gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn last_user_message(&self, call: usize) -> String {
        self.last_user_messages.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat_stream(&self, request: &ChatRequest) -> std::result::Result<ChunkStream, LlmError> {
        self.call_times.lock().unwrap().push(tokio::time::Instant::now());
        self.last_user_messages.lock().unwrap().push(
            request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .and_then(|m| m.content.clone())
                .unwrap_or_default(),
        );

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::provider("script exhausted"))?;
        match turn {
            ScriptTurn::Fail(error) => Err(error),
            ScriptTurn::Chunks(chunks) => {
                let items: Vec<std::result::Result<StreamChunk, LlmError>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }
}

fn tool_call_turn(calls: &[(&str, &str)]) -> ScriptTurn {
    let mut chunks = Vec::new();
    for (index, (name, args)) in calls.iter().enumerate() {
        let id = format!("call_{index}");
        chunks.push(StreamChunk::tool_call_start(&id, *name));
        chunks.push(StreamChunk::tool_call_delta(&id, *args));
    }
    chunks.push(StreamChunk::Done);
    ScriptTurn::Chunks(chunks)
}

fn text_turn(text: &str) -> ScriptTurn {
    ScriptTurn::Chunks(vec![StreamChunk::text(text), StreamChunk::Done])
}

fn terminate_turn(message: &str) -> ScriptTurn {
    let args = json!({ "message": message }).to_string();
    ScriptTurn::Chunks(vec![
        StreamChunk::tool_call_start("call_term", TERMINATE_TOOL),
        StreamChunk::tool_call_delta("call_term", &args),
        StreamChunk::Done,
    ])
}

// ---------------------------------------------------------------------------
// Test tools
// ---------------------------------------------------------------------------

/// File-writer stand-in that logs its invocations.
struct FileWriteTool {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "fs-write_file_operator"
    }
    fn description(&self) -> String {
        "Write contents to a file.".to_owned()
    }
    fn parameters_schema(&self) -> String {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "contents": { "type": "string" }
            },
            "required": ["file_path", "contents"]
        })
        .to_string()
    }
    async fn execute(
        &self,
        arguments: &str,
        _ctx: &ToolContext,
    ) -> std::result::Result<ToolExecuteResult, ToolError> {
        let args: serde_json::Value = serde_json::from_str(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let path = args["file_path"].as_str().unwrap_or("unknown").to_owned();
        self.log.lock().unwrap().push(path.clone());
        Ok(ToolExecuteResult::new(format!(
            "File written successfully (created): {path}"
        )))
    }
}

/// Echoes a fixed label, used for parallel batches.
struct LabelTool {
    label: &'static str,
}

#[async_trait]
impl Tool for LabelTool {
    fn name(&self) -> &str {
        self.label
    }
    fn description(&self) -> String {
        format!("Returns '{}'.", self.label)
    }
    fn parameters_schema(&self) -> String {
        "{}".to_owned()
    }
    async fn execute(
        &self,
        _arguments: &str,
        _ctx: &ToolContext,
    ) -> std::result::Result<ToolExecuteResult, ToolError> {
        Ok(ToolExecuteResult::new(format!("output of {}", self.label)))
    }
}

/// Blocks until released, signalling the test when it starts.
struct GateTool {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Tool for GateTool {
    fn name(&self) -> &str {
        "test-gate"
    }
    fn description(&self) -> String {
        "Blocks until released.".to_owned()
    }
    fn parameters_schema(&self) -> String {
        "{}".to_owned()
    }
    async fn execute(
        &self,
        _arguments: &str,
        _ctx: &ToolContext,
    ) -> std::result::Result<ToolExecuteResult, ToolError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(ToolExecuteResult::new("gate passed"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    executor: Arc<PlanExecutor>,
    provider: Arc<ScriptedProvider>,
    recorder: Arc<SqliteRecorder>,
}

fn harness_with_config(
    turns: Vec<ScriptTurn>,
    extra_tools: Vec<Arc<dyn Tool>>,
    config: EngineConfig,
) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    // Keep run directories out of the working tree.
    let scratch = std::env::temp_dir().join("taskloom-integration");
    let config = config
        .with_base_dir(scratch.join("runs"))
        .with_upload_dir(scratch.join("uploads"));
    let provider = ScriptedProvider::new(turns);
    let recorder = Arc::new(SqliteRecorder::in_memory().unwrap());
    let form_timeout = config.form_input_timeout();
    let executor = Arc::new(PlanExecutor::new(
        config,
        provider.clone(),
        recorder.clone(),
    ));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(TerminateTool));
    registry.register(Arc::new(ErrorReportTool));
    registry.register(Arc::new(SystemErrorReportTool));
    registry.register(Arc::new(FormInputTool::new(
        executor.wait_registry(),
        executor.interrupter(),
        form_timeout,
    )));
    registry.register(Arc::new(SubplanTool::new(executor.clone())));
    for tool in extra_tools {
        registry.register(tool);
    }
    executor.install_tools(Arc::new(registry)).unwrap();

    Harness {
        executor,
        provider,
        recorder,
    }
}

fn harness(turns: Vec<ScriptTurn>, extra_tools: Vec<Arc<dyn Tool>>) -> Harness {
    harness_with_config(
        turns,
        extra_tools,
        EngineConfig::default().with_max_agent_steps(8),
    )
}

fn single_step_plan(requirement: &str) -> Plan {
    Plan::new("", "Test plan", "user request", vec![Step::new(0, requirement)])
}

// ---------------------------------------------------------------------------
// S1: happy path, single step, single tool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_single_step_single_tool() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let write_args = json!({"file_path": "a.txt", "contents": "hi"}).to_string();
    let harness = harness(
        vec![
            tool_call_turn(&[("fs-write_file_operator", &write_args)]),
            terminate_turn("File written successfully (created): a.txt"),
        ],
        vec![Arc::new(FileWriteTool { log: log.clone() })],
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("[AGENT_A] write the file"), None)
        .await
        .unwrap();

    assert!(plan.completed);
    assert_eq!(
        plan.result.as_deref(),
        Some("File written successfully (created): a.txt")
    );
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(log.lock().unwrap().clone(), vec!["a.txt".to_owned()]);

    // The tool call row carries its two-phase result.
    let detail = harness
        .recorder
        .get_agent_execution_detail(&plan.steps[0].step_id)
        .await
        .unwrap();
    assert_eq!(detail.status, ExecutionStatus::Finished);
    let first_round = &detail.think_act_steps[0];
    assert_eq!(first_round.act_tool_info_list.len(), 1);
    let info = &first_round.act_tool_info_list[0];
    assert!(info.tool_call_id.starts_with("toolcall-"));
    assert!(info.result.as_ref().unwrap().contains("File written"));

    // The reader returns a single-plan tree.
    let view = harness
        .executor
        .reader()
        .plan_details(&plan.current_plan_id)
        .await
        .unwrap();
    assert!(view.sub_plans.is_empty());
    assert!(view.completed);
    assert_eq!(view.agent_executions.len(), 1);
}

// ---------------------------------------------------------------------------
// S2: parallel tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_parallel_tools_keep_input_order() {
    let harness = harness(
        vec![
            tool_call_turn(&[("test-t1", "{}"), ("test-t2", "{}")]),
            terminate_turn("both ran"),
        ],
        vec![
            Arc::new(LabelTool { label: "test-t1" }),
            Arc::new(LabelTool { label: "test-t2" }),
        ],
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("run both tools"), None)
        .await
        .unwrap();
    assert!(plan.completed);

    let detail = harness
        .recorder
        .get_agent_execution_detail(&plan.steps[0].step_id)
        .await
        .unwrap();
    let infos = &detail.think_act_steps[0].act_tool_info_list;
    assert_eq!(infos.len(), 2);
    // Distinct system ids, results in input order.
    assert_ne!(infos[0].tool_call_id, infos[1].tool_call_id);
    assert_eq!(infos[0].name, "test-t1");
    assert_eq!(infos[1].name, "test-t2");
    assert!(infos[0].result.as_ref().unwrap().contains("output of test-t1"));
    assert!(infos[1].result.as_ref().unwrap().contains("output of test-t2"));
}

// ---------------------------------------------------------------------------
// S3: sub-plan linkage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_subplan_linkage() {
    let subplan_args = json!({
        "title": "Nested work",
        "user_request": "handle the inner task",
        "steps": ["do the inner thing"]
    })
    .to_string();
    let harness = harness(
        vec![
            // Root step: spawn the sub-plan.
            tool_call_turn(&[(SUBPLAN_TOOL, &subplan_args)]),
            // Sub-plan's single step terminates directly.
            terminate_turn("inner done"),
            // Root continues with the sub-plan result and terminates.
            terminate_turn("outer done"),
        ],
        Vec::new(),
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("delegate to a sub-plan"), None)
        .await
        .unwrap();
    assert!(plan.completed);
    assert_eq!(plan.result.as_deref(), Some("outer done"));

    // Two plans share the root; the sub-plan is linked by tool call id.
    let plans = harness
        .recorder
        .plans_by_root(&plan.current_plan_id)
        .await
        .unwrap();
    assert_eq!(plans.len(), 2);
    let sub = plans
        .iter()
        .find(|p| p.current_plan_id != plan.current_plan_id)
        .unwrap();
    assert_eq!(sub.parent_plan_id.as_deref(), Some(plan.current_plan_id.as_str()));
    assert_eq!(sub.root_plan_id, plan.current_plan_id);
    assert!(sub.completed);
    assert_eq!(sub.result.as_deref(), Some("inner done"));

    let spawning_call = harness
        .recorder
        .find_act_tool_by_call_id(sub.tool_call_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(spawning_call.name, SUBPLAN_TOOL);
    assert!(spawning_call.result.as_ref().unwrap().contains("inner done"));

    // The reader nests the sub-plan and resolves its parent tool call.
    let view = harness
        .executor
        .reader()
        .plan_details(&plan.current_plan_id)
        .await
        .unwrap();
    assert_eq!(view.sub_plans.len(), 1);
    let sub_view = &view.sub_plans[0];
    assert_eq!(sub_view.parent_act_tool_call.as_ref().unwrap().name, SUBPLAN_TOOL);
}

// ---------------------------------------------------------------------------
// S4: LLM retry exhaustion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn s4_llm_retry_exhaustion() {
    let harness = harness(
        vec![
            ScriptTurn::Fail(LlmError::dns("resolution timed out (1)")),
            ScriptTurn::Fail(LlmError::dns("resolution timed out (2)")),
            ScriptTurn::Fail(LlmError::dns("resolution timed out (3)")),
        ],
        Vec::new(),
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("doomed step"), None)
        .await
        .unwrap();

    // Exactly three attempts with 2s and 4s waits between them.
    assert_eq!(harness.provider.call_count(), 3);
    let gaps = harness.provider.call_gaps();
    assert!(gaps[0] >= Duration::from_secs(2) && gaps[0] < Duration::from_secs(3));
    assert!(gaps[1] >= Duration::from_secs(4) && gaps[1] < Duration::from_secs(5));

    assert!(plan.completed);
    assert_eq!(plan.steps[0].status, StepStatus::Failed);
    assert!(
        plan.steps[0]
            .error_message
            .as_ref()
            .unwrap()
            .contains("resolution timed out (3)")
    );

    // The failure is recorded as a synthesized system error report call.
    let detail = harness
        .recorder
        .get_agent_execution_detail(&plan.steps[0].step_id)
        .await
        .unwrap();
    assert_eq!(detail.status, ExecutionStatus::Failed);
    let report = detail
        .think_act_steps
        .iter()
        .flat_map(|c| &c.act_tool_info_list)
        .find(|info| info.name == SYSTEM_ERROR_REPORT_TOOL)
        .unwrap();
    assert!(report.parameters.contains("resolution timed out (3)"));
    assert!(report.result.is_some());
}

// ---------------------------------------------------------------------------
// S5: early-termination threshold
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_early_termination_threshold() {
    let harness = harness(
        vec![
            text_turn("I believe the answer is 42."),
            text_turn("Still just thinking."),
            text_turn("No action needed, really."),
            // Never reached: the step must fail after three thinking-only
            // rounds.
            terminate_turn("should not happen"),
        ],
        Vec::new(),
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("think about it"), None)
        .await
        .unwrap();

    assert_eq!(harness.provider.call_count(), 3);
    assert_eq!(plan.steps[0].status, StepStatus::Failed);
    assert!(
        plan.steps[0]
            .error_message
            .as_ref()
            .unwrap()
            .contains("Early termination threshold reached")
    );

    // The second and third prompts carry the reinforcement directive.
    assert!(!harness.provider.last_user_message(0).contains("must call at least one tool"));
    assert!(harness.provider.last_user_message(1).contains("must call at least one tool"));
    assert!(harness.provider.last_user_message(2).contains("must call at least one tool"));
}

// ---------------------------------------------------------------------------
// S6: form input timeout, then late submission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn s6_form_timeout_then_late_submission() {
    let form_args = json!({
        "title": "Need details",
        "inputs": [{"name": "city", "label": "Which city?"}]
    })
    .to_string();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let harness = harness_with_config(
        vec![
            tool_call_turn(&[(FORM_INPUT_TOOL, &form_args)]),
            tool_call_turn(&[("test-gate", "{}")]),
            terminate_turn("completed without user input"),
        ],
        vec![Arc::new(GateTool {
            started: started.clone(),
            release: release.clone(),
        })],
        EngineConfig::default()
            .with_max_agent_steps(8)
            .with_form_input_timeout(2),
    );

    let root_id = "plan-form-root";
    let mut plan = single_step_plan("ask the user");
    plan.current_plan_id = root_id.to_owned();

    let executor = harness.executor.clone();
    let exec = tokio::spawn(async move { executor.execute_root(plan, None).await });

    // The gate round only starts after the form round timed out.
    started.notified().await;
    let wait_registry = harness.executor.wait_registry();

    // Late submission: the slot is retained past the timeout.
    assert!(wait_registry.submit(root_id, json!({"city": "Berlin"})).await);
    let state = wait_registry.get_wait_state(root_id).await.unwrap();
    assert!(!state.waiting);
    assert_eq!(state.form_inputs, Some(json!({"city": "Berlin"})));

    release.notify_one();
    let plan = exec.await.unwrap().unwrap();

    // The step was not resurrected by the late submission.
    assert!(plan.completed);
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(plan.result.as_deref(), Some("completed without user input"));

    // The form round observed the timeout.
    let detail = harness
        .recorder
        .get_agent_execution_detail(&plan.steps[0].step_id)
        .await
        .unwrap();
    let form_info = &detail.think_act_steps[0].act_tool_info_list[0];
    assert_eq!(form_info.name, FORM_INPUT_TOOL);
    assert!(form_info.result.as_ref().unwrap().contains("timed out"));

    // Teardown removed the slot.
    assert!(wait_registry.get_wait_state(root_id).await.is_none());
}

// ---------------------------------------------------------------------------
// Cooperative interruption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interruption_stops_at_the_next_safe_point() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let harness = harness(
        vec![tool_call_turn(&[("test-gate", "{}")])],
        vec![Arc::new(GateTool {
            started: started.clone(),
            release: release.clone(),
        })],
    );

    let root_id = "plan-int-root";
    let plan = Plan::new(
        root_id,
        "Interruptible",
        "user request",
        vec![Step::new(0, "first"), Step::new(1, "second")],
    );
    let executor = harness.executor.clone();
    let exec = tokio::spawn(async move { executor.execute_root(plan, None).await });

    // Interrupt while the in-flight tool call is still running.
    started.notified().await;
    let interrupter = harness.executor.interrupter();
    assert!(interrupter.request(root_id));
    release.notify_one();

    let plan = exec.await.unwrap().unwrap();
    assert!(plan.completed);
    assert_eq!(plan.summary.as_deref(), Some("Plan interrupted"));
    assert_eq!(plan.steps[0].status, StepStatus::Interrupted);
    assert_eq!(plan.steps[1].status, StepStatus::NotStarted);

    // The in-flight tool completed; no further LLM calls were made.
    assert_eq!(harness.provider.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Error report tool fails the step
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_report_tool_fails_the_step() {
    let report_args = json!({"error_message": "cannot satisfy the requirement"}).to_string();
    let harness = harness(
        vec![tool_call_turn(&[(ERROR_REPORT_TOOL, &report_args)])],
        Vec::new(),
    );

    let plan = harness
        .executor
        .execute_root(single_step_plan("impossible step"), None)
        .await
        .unwrap();

    assert!(plan.completed);
    assert_eq!(plan.steps[0].status, StepStatus::Failed);
    assert_eq!(
        plan.steps[0].error_message.as_deref(),
        Some("cannot satisfy the requirement")
    );
    assert!(
        plan.summary
            .as_ref()
            .unwrap()
            .contains("cannot satisfy the requirement")
    );

    // The think/act was still recorded for observability.
    let detail = harness
        .recorder
        .get_agent_execution_detail(&plan.steps[0].step_id)
        .await
        .unwrap();
    assert_eq!(detail.think_act_steps.len(), 1);
}

// ---------------------------------------------------------------------------
// Multi-step ordering and tagged agent selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn steps_execute_in_order_with_tagged_agents() {
    let harness = harness(
        vec![terminate_turn("first result"), terminate_turn("second result")],
        Vec::new(),
    );
    let executor = harness
        .executor
        .clone();

    let plan = Plan::new(
        "",
        "Two steps",
        "user request",
        vec![
            Step::new(0, "[RESEARCHER] gather facts"),
            Step::new(1, "summarize"),
        ],
    );
    let plan = executor.execute_root(plan, None).await.unwrap();

    assert!(plan.completed);
    assert_eq!(plan.steps[0].result.as_deref(), Some("first result"));
    assert_eq!(plan.steps[1].result.as_deref(), Some("second result"));
    assert_eq!(plan.result.as_deref(), Some("second result"));
    assert_eq!(plan.current_step_index, 1);

    // Unknown tag falls back to the default profile; the name is recorded.
    assert_eq!(plan.steps[0].agent_name.as_deref(), Some("DEFAULT_AGENT"));

    // Executions are recorded per step with strictly ordered cycles.
    for step in &plan.steps {
        let detail = harness
            .recorder
            .get_agent_execution_detail(&step.step_id)
            .await
            .unwrap();
        assert_eq!(detail.status, ExecutionStatus::Finished);
        assert_eq!(detail.think_act_steps.len(), 1);
    }
}
