//! The dynamic agent's ReAct loop.
//!
//! Drives one step to completion through think/act rounds:
//!
//! 1. **Think** — check interruption, compress memory, assemble the prompt
//!    (system, conversation history, working messages, step environment),
//!    call the LLM through the streaming handler, classify the response.
//! 2. **Act** — persist the think-act cycle with its tool-call entries,
//!    dispatch the calls (sequentially when the form tool is in the
//!    batch), apply results, detect terminable and error-reporting tools,
//!    and watch for repeated-result loops.
//!
//! Retryable LLM errors back off exponentially up to three attempts;
//! exhaustion synthesizes a system error report so the failure lands in
//! the record like any other tool outcome. Three consecutive thinking-only
//! responses fail the step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::{ExecutionContext, ToolContext};
use crate::dispatch::{
    DispatchStatus, ExecutionOutcome, ParallelExecutionRequest, ParallelExecutionService,
};
use crate::id::{Ids, now_millis};
use crate::interrupt::InterruptionManager;
use crate::llm::{ChatProvider, ChatRequest, LlmError};
use crate::memory::{COMPRESSION_SUMMARY_FLAG, MemoryLimitService};
use crate::message::{ChatMessage, MessageRole};
use crate::record::{
    ActToolInfo, ActToolResult, AgentExecutionRecord, ExecutionStatus, SqliteRecorder, Step,
    ThinkActRecord,
};
use crate::stream::{self, StreamingResult};
use crate::tool::ToolRegistry;
use crate::tools::{
    FORM_INPUT_TOOL, SYSTEM_ERROR_REPORT_TOOL, extract_error_message, is_error_report_tool,
};

use super::profile::AgentProfile;

/// LLM attempts per think phase, including the first.
const MAX_LLM_ATTEMPTS: usize = 3;

/// Consecutive thinking-only responses that fail the step.
const EARLY_TERMINATION_LIMIT: usize = 3;

/// Sliding window size for repeated-result loop detection.
const RESULT_WINDOW: usize = 3;

const REINFORCEMENT_DIRECTIVE: &str = "IMPORTANT: you must call at least one tool in your next \
     response. A text-only response does not advance the step.";

/// Backoff before retry attempt `attempt + 1`, `min(60s, 2s * 2^(k-1))`.
#[must_use]
pub(crate) fn retry_backoff(attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(6);
    Duration::from_secs((2_u64 << exponent).min(60))
}

/// Terminal outcome of one agent execution.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Terminal status of the execution.
    pub status: ExecutionStatus,
    /// Step result carried by the terminating tool, if any.
    pub result: Option<String>,
    /// Proximate cause when the execution failed.
    pub error_message: Option<String>,
}

impl AgentOutcome {
    fn finished(result: String) -> Self {
        Self {
            status: ExecutionStatus::Finished,
            result: Some(result),
            error_message: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error_message: Some(message),
        }
    }

    fn interrupted() -> Self {
        Self {
            status: ExecutionStatus::Interrupted,
            result: None,
            error_message: None,
        }
    }
}

/// Mutable per-step loop state.
struct StepState {
    agent_messages: Vec<ChatMessage>,
    early_terminations: usize,
    result_window: Vec<String>,
}

/// A think phase that produced tool calls, ready for the act phase.
struct PreparedAct {
    think_act: ThinkActRecord,
    provider_calls: Vec<crate::message::ToolCall>,
    response_text: String,
}

enum ThinkOutcome {
    Act(Box<PreparedAct>),
    Retry,
    Failed(String),
    Interrupted,
}

enum ActVerdict {
    Continue,
    Finished(String),
    Failed(String),
    Interrupted,
}

enum ThinkFailure {
    Interrupted,
    Fatal(LlmError),
    Exhausted(Vec<LlmError>),
}

/// One agent bound to one step execution.
#[derive(Clone)]
pub struct DynamicAgent {
    profile: AgentProfile,
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    recorder: Arc<SqliteRecorder>,
    interrupter: Arc<InterruptionManager>,
    memory: MemoryLimitService,
    dispatcher: ParallelExecutionService,
    model: String,
    max_steps: usize,
}

impl std::fmt::Debug for DynamicAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicAgent")
            .field("profile", &self.profile.name)
            .field("model", &self.model)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl DynamicAgent {
    /// Assemble an agent from its profile and the engine's shared services.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        profile: AgentProfile,
        provider: Arc<dyn ChatProvider>,
        tools: Arc<ToolRegistry>,
        recorder: Arc<SqliteRecorder>,
        interrupter: Arc<InterruptionManager>,
        memory: MemoryLimitService,
        dispatcher: ParallelExecutionService,
        default_model: &str,
        default_max_steps: usize,
    ) -> Self {
        let model = profile
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_owned());
        let max_steps = profile.max_steps.unwrap_or(default_max_steps);
        Self {
            profile,
            provider,
            tools,
            recorder,
            interrupter,
            memory,
            dispatcher,
            model,
            max_steps,
        }
    }

    /// Drive the step to a terminal state.
    ///
    /// Sets `result`/`error_message` on the step; the caller owns the
    /// step's status transition and persistence.
    pub async fn execute_step(
        &self,
        ctx: &ExecutionContext,
        step: &mut Step,
        conversation: &[ChatMessage],
    ) -> AgentOutcome {
        let span = info_span!(
            "agent",
            agent.name = %self.profile.name,
            agent.model = %self.model,
            step.id = %step.step_id,
            plan.id = %ctx.current_plan_id,
            plan.depth = ctx.plan_depth,
        );
        self.run_inner(ctx, step, conversation).instrument(span).await
    }

    async fn run_inner(
        &self,
        ctx: &ExecutionContext,
        step: &mut Step,
        conversation: &[ChatMessage],
    ) -> AgentOutcome {
        let mut record =
            AgentExecutionRecord::start(&step.step_id, &self.profile.name, self.max_steps);
        record.agent_description = Some(self.profile.description.clone());
        record.agent_request = Some(step.step_requirement.clone());
        record.conversation_id = ctx.conversation_id.clone();
        record.model_name = Some(self.model.clone());

        record.id = match self.recorder.record_agent_start(&record).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, step_id = %step.step_id, "Failed to record agent start");
                return AgentOutcome::failed(format!("failed to record agent start: {e}"));
            }
        };

        let mut state = StepState {
            agent_messages: Vec::new(),
            early_terminations: 0,
            result_window: Vec::new(),
        };

        let outcome = self
            .run_rounds(ctx, step, conversation, &mut record, &mut state)
            .await;

        record.status = outcome.status;
        record.result = outcome.result.clone();
        record.error_message = outcome.error_message.clone();
        record.end_time = Some(now_millis());
        if let Err(e) = self.recorder.record_agent_end(&record).await {
            warn!(error = %e, "Failed to record agent end");
        }

        if outcome.result.is_some() {
            step.result = outcome.result.clone();
        }
        if outcome.error_message.is_some() {
            step.error_message = outcome.error_message.clone();
        }

        info!(
            agent = %self.profile.name,
            status = outcome.status.as_str(),
            rounds = record.current_step,
            "Agent execution ended",
        );
        outcome
    }

    async fn run_rounds(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        conversation: &[ChatMessage],
        record: &mut AgentExecutionRecord,
        state: &mut StepState,
    ) -> AgentOutcome {
        for round in 1..=self.max_steps {
            record.current_step = round;

            if !self.interrupter.should_continue(&ctx.root_plan_id) {
                info!(round, "Agent observed interruption before think phase");
                return AgentOutcome::interrupted();
            }
            debug!(round, "Starting think phase");

            match self.think(ctx, step, conversation, record, state, round).await {
                ThinkOutcome::Act(prepared) => {
                    match self.act(ctx, state, *prepared).await {
                        ActVerdict::Continue => {}
                        ActVerdict::Finished(result) => return AgentOutcome::finished(result),
                        ActVerdict::Failed(message) => return AgentOutcome::failed(message),
                        ActVerdict::Interrupted => return AgentOutcome::interrupted(),
                    }
                }
                // A thinking-only round below the threshold; the next round
                // carries the reinforcement directive.
                ThinkOutcome::Retry => {}
                ThinkOutcome::Failed(message) => return AgentOutcome::failed(message),
                ThinkOutcome::Interrupted => return AgentOutcome::interrupted(),
            }
        }

        warn!(max_steps = self.max_steps, "Agent exhausted its round budget");
        AgentOutcome::failed(format!(
            "agent reached the maximum of {} rounds without terminating",
            self.max_steps
        ))
    }

    async fn think(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        conversation: &[ChatMessage],
        record: &AgentExecutionRecord,
        state: &mut StepState,
        round: usize,
    ) -> ThinkOutcome {
        let think_start = now_millis();

        state.agent_messages = self
            .memory
            .apply(std::mem::take(&mut state.agent_messages))
            .await;

        let env = self.build_step_prompt(step, round, state.early_terminations > 0);

        let mut messages = Vec::new();
        if !self.profile.system_prompt.is_empty() {
            messages.push(ChatMessage::system(&self.profile.system_prompt));
        }
        messages.extend_from_slice(conversation);
        messages.extend(state.agent_messages.iter().cloned());
        messages.push(ChatMessage::user(&env));

        let request = ChatRequest::new(&self.model)
            .messages(messages)
            .tools(self.tools.definitions());
        let input_chars = request.char_count();

        let result = match self.call_with_retry(&request, &ctx.root_plan_id, input_chars).await {
            Ok(result) => result,
            Err(ThinkFailure::Interrupted) => return ThinkOutcome::Interrupted,
            Err(ThinkFailure::Fatal(llm_error)) => {
                error!(error = %llm_error, "Non-retryable LLM error");
                let think_act = ThinkActRecord {
                    parent_execution_id: record.id,
                    think_act_id: Ids::new_think_act_id(),
                    think_input: env,
                    input_char_count: input_chars,
                    error_message: Some(llm_error.to_string()),
                    think_start_time: think_start,
                    think_end_time: now_millis(),
                    ..ThinkActRecord::default()
                };
                if let Err(e) = self.recorder.record_think_act(&think_act).await {
                    warn!(error = %e, "Failed to record failed think phase");
                }
                return ThinkOutcome::Failed(llm_error.to_string());
            }
            Err(ThinkFailure::Exhausted(errors)) => {
                return self
                    .report_llm_exhaustion(ctx, record, &errors, env, input_chars, think_start)
                    .await;
            }
        };

        let think_end = now_millis();

        if result.effective_tool_calls.is_empty() {
            let think_act = ThinkActRecord {
                parent_execution_id: record.id,
                think_act_id: Ids::new_think_act_id(),
                think_input: env,
                think_output: result.effective_text.clone(),
                input_char_count: result.input_char_count,
                output_char_count: result.output_char_count,
                error_message: result.last_response.clone(),
                think_start_time: think_start,
                think_end_time: think_end,
                ..ThinkActRecord::default()
            };
            if let Err(e) = self.recorder.record_think_act(&think_act).await {
                warn!(error = %e, "Failed to record thinking-only cycle");
            }

            if result.early_terminated {
                state.early_terminations += 1;
                warn!(
                    streak = state.early_terminations,
                    "Model produced a thinking-only response"
                );
                if state.early_terminations >= EARLY_TERMINATION_LIMIT {
                    return ThinkOutcome::Failed(format!(
                        "Early termination threshold reached: {EARLY_TERMINATION_LIMIT} \
                         consecutive responses without tool calls"
                    ));
                }
                return ThinkOutcome::Retry;
            }

            let message = result
                .last_response
                .unwrap_or_else(|| "model returned an empty response".to_owned());
            return ThinkOutcome::Failed(message);
        }

        // A think that yields tool calls resets the thinking-only streak.
        state.early_terminations = 0;

        let round_tool_call_id = Ids::new_tool_call_id();
        let single = result.effective_tool_calls.len() == 1;
        let act_infos: Vec<ActToolInfo> = result
            .effective_tool_calls
            .iter()
            .map(|call| {
                let system_id = if single {
                    round_tool_call_id.clone()
                } else {
                    Ids::new_tool_call_id()
                };
                ActToolInfo::new(system_id, &call.name, &call.arguments)
            })
            .collect();

        let call_digest: Vec<String> = result
            .effective_tool_calls
            .iter()
            .map(|c| format!("{}({})", c.name, c.arguments))
            .collect();
        let mut think_act = ThinkActRecord {
            parent_execution_id: record.id,
            think_act_id: Ids::new_think_act_id(),
            think_input: env,
            think_output: format!(
                "{}\n[tool calls: {}]",
                result.effective_text,
                call_digest.join(", ")
            ),
            input_char_count: result.input_char_count,
            output_char_count: result.output_char_count,
            error_message: result.last_response.clone(),
            action_needed: true,
            think_start_time: think_start,
            think_end_time: think_end,
            act_tool_info_list: act_infos,
            ..ThinkActRecord::default()
        };

        think_act.id = match self.recorder.record_think_act(&think_act).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to record think-act cycle");
                0
            }
        };

        ThinkOutcome::Act(Box::new(PreparedAct {
            think_act,
            provider_calls: result.effective_tool_calls,
            response_text: result.effective_text,
        }))
    }

    async fn act(
        &self,
        ctx: &ExecutionContext,
        state: &mut StepState,
        prepared: PreparedAct,
    ) -> ActVerdict {
        let PreparedAct {
            mut think_act,
            provider_calls,
            response_text,
        } = prepared;
        let act_start = now_millis();

        let requests: Vec<ParallelExecutionRequest> = think_act
            .act_tool_info_list
            .iter()
            .map(|info| {
                ParallelExecutionRequest::new(&info.name, &info.parameters)
                    .with_tool_call_id(&info.tool_call_id)
            })
            .collect();

        let parent_ctx = ToolContext::for_call(ctx, &think_act.think_act_id);
        let exclusive = think_act
            .act_tool_info_list
            .iter()
            .any(|info| info.name == FORM_INPUT_TOOL);

        let outcomes = if exclusive {
            self.dispatcher
                .dispatch_sequential(requests, &self.tools, &parent_ctx)
                .await
        } else {
            self.dispatcher
                .dispatch_parallel(requests, &self.tools, &parent_ctx)
                .await
        };

        // Second phase of the tool write: attach results by tool-call id.
        let mut results = Vec::with_capacity(outcomes.len());
        for (info, outcome) in think_act.act_tool_info_list.iter_mut().zip(&outcomes) {
            let result_json = outcome_result_json(outcome);
            info.result = Some(result_json.clone());
            results.push(ActToolResult::new(
                &info.tool_call_id,
                &info.name,
                &info.parameters,
                result_json,
            ));
        }
        if let Err(e) = self.recorder.record_action_result(&results).await {
            warn!(error = %e, "Failed to record tool results");
        }

        // Update the working history: the assistant turn plus one tool
        // response per call, keyed by the provider's call ids.
        state.agent_messages.push(ChatMessage::assistant_with_tool_calls(
            (!response_text.is_empty()).then(|| response_text.clone()),
            provider_calls.clone(),
        ));
        for (call, outcome) in provider_calls.iter().zip(&outcomes) {
            state
                .agent_messages
                .push(ChatMessage::tool_response(&call.id, outcome.observation()));
        }
        state.agent_messages.retain(|m| {
            matches!(m.role, MessageRole::Assistant | MessageRole::Tool)
                || m.has_flag(COMPRESSION_SUMMARY_FLAG)
        });

        let mut step_result = None;
        let mut failure = None;
        let mut interrupted = false;
        for outcome in &outcomes {
            match outcome.status {
                DispatchStatus::Interrupted => interrupted = true,
                DispatchStatus::Error => {}
                DispatchStatus::Success => {
                    if is_error_report_tool(&outcome.tool_name) {
                        let reported = think_act
                            .act_tool_info_list
                            .iter()
                            .find(|info| info.tool_call_id == outcome.tool_call_id)
                            .and_then(|info| extract_error_message(&info.parameters))
                            .unwrap_or_else(|| outcome.observation());
                        failure = Some(reported);
                    } else if self
                        .tools
                        .get(&outcome.tool_name)
                        .is_some_and(|tool| tool.can_terminate())
                    {
                        step_result = Some(outcome.output.clone().unwrap_or_default());
                    }
                }
            }
        }

        for outcome in &outcomes {
            if push_result_window(&mut state.result_window, outcome.observation()) {
                warn!("Repeated tool results detected; forcing memory compression");
                state.agent_messages = self
                    .memory
                    .force_compress(std::mem::take(&mut state.agent_messages));
            }
        }

        let combined: Vec<String> = outcomes.iter().map(ExecutionOutcome::observation).collect();
        let combined = combined.join("\n");
        think_act.act_start_time = act_start;
        think_act.act_end_time = now_millis();
        think_act.action_result = Some(combined.clone());
        if think_act.id != 0
            && let Err(e) = self
                .recorder
                .record_think_act_result(think_act.id, &combined, think_act.act_end_time)
                .await
        {
            warn!(error = %e, "Failed to record act result");
        }

        if interrupted {
            return ActVerdict::Interrupted;
        }
        if let Some(message) = failure {
            return ActVerdict::Failed(message);
        }
        if let Some(result) = step_result {
            return ActVerdict::Finished(result);
        }
        ActVerdict::Continue
    }

    async fn call_with_retry(
        &self,
        request: &ChatRequest,
        root_plan_id: &str,
        input_chars: usize,
    ) -> Result<StreamingResult, ThinkFailure> {
        let mut errors = Vec::new();
        for attempt in 1..=MAX_LLM_ATTEMPTS {
            if !self.interrupter.should_continue(root_plan_id) {
                return Err(ThinkFailure::Interrupted);
            }
            match self.provider.chat_stream(request).await {
                Ok(chunk_stream) => {
                    return Ok(stream::collect(chunk_stream, input_chars).await);
                }
                Err(llm_error) if llm_error.is_retryable() => {
                    warn!(attempt, error = %llm_error, "Retryable LLM error");
                    errors.push(llm_error);
                    if attempt < MAX_LLM_ATTEMPTS {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                    }
                }
                Err(llm_error) => return Err(ThinkFailure::Fatal(llm_error)),
            }
        }
        Err(ThinkFailure::Exhausted(errors))
    }

    /// All retries used: synthesize a system error report tool call so the
    /// failure is recorded in the same shape as any other tool outcome.
    async fn report_llm_exhaustion(
        &self,
        ctx: &ExecutionContext,
        record: &AgentExecutionRecord,
        errors: &[LlmError],
        env: String,
        input_chars: usize,
        think_start: i64,
    ) -> ThinkOutcome {
        let latest = errors
            .last()
            .map_or_else(|| "unknown LLM failure".to_owned(), ToString::to_string);
        error!(
            attempts = errors.len(),
            error = %latest,
            "LLM retries exhausted; synthesizing system error report"
        );

        let tool_call_id = Ids::new_tool_call_id();
        let parameters = serde_json::json!({ "error_message": latest }).to_string();
        let think_act = ThinkActRecord {
            parent_execution_id: record.id,
            think_act_id: Ids::new_think_act_id(),
            think_input: env,
            think_output: format!("LLM call failed after {} attempts", errors.len()),
            input_char_count: input_chars,
            error_message: Some(latest.clone()),
            action_needed: true,
            think_start_time: think_start,
            think_end_time: now_millis(),
            act_tool_info_list: vec![ActToolInfo::new(
                &tool_call_id,
                SYSTEM_ERROR_REPORT_TOOL,
                &parameters,
            )],
            ..ThinkActRecord::default()
        };
        let think_id = match self.recorder.record_think_act(&think_act).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to record system error report cycle");
                0
            }
        };

        // Run the report through the normal dispatch path so observability
        // matches regular tool calls even here.
        let request = ParallelExecutionRequest::new(SYSTEM_ERROR_REPORT_TOOL, &parameters)
            .with_tool_call_id(&tool_call_id);
        let parent_ctx = ToolContext::for_call(ctx, &tool_call_id);
        let outcomes = self
            .dispatcher
            .dispatch_sequential(vec![request], &self.tools, &parent_ctx)
            .await;
        let observation = outcomes
            .first()
            .map_or_else(|| latest.clone(), ExecutionOutcome::observation);

        let result_json = serde_json::json!({ "output": observation }).to_string();
        if let Err(e) = self
            .recorder
            .record_action_result(&[ActToolResult::new(
                &tool_call_id,
                SYSTEM_ERROR_REPORT_TOOL,
                &parameters,
                result_json,
            )])
            .await
        {
            warn!(error = %e, "Failed to record system error report result");
        }
        if think_id != 0
            && let Err(e) = self
                .recorder
                .record_think_act_result(think_id, &observation, now_millis())
                .await
        {
            warn!(error = %e, "Failed to record system error report act result");
        }

        ThinkOutcome::Failed(latest)
    }

    fn build_step_prompt(&self, step: &Step, round: usize, reinforce: bool) -> String {
        let mut prompt = format!(
            "Current step {} (round {round}/{}): {}",
            step.step_index, self.max_steps, step.step_requirement
        );

        let states = self.tools.tool_states();
        if !states.is_empty() {
            prompt.push_str("\n\nEnvironment:");
            for state in states {
                prompt.push_str(&format!("\n{}: {}", state.key, state.state_string));
            }
        }

        if reinforce {
            prompt.push_str("\n\n");
            prompt.push_str(REINFORCEMENT_DIRECTIVE);
        }
        prompt
    }
}

/// Slide one processed result into the loop-detection window.
///
/// Returns `true` when the last [`RESULT_WINDOW`] results are identical;
/// the window is cleared in that case so the next trigger needs a fresh
/// streak. Exact string equality only; fuzzy matching would break
/// legitimate repeated queries.
fn push_result_window(window: &mut Vec<String>, observation: String) -> bool {
    window.push(observation);
    if window.len() > RESULT_WINDOW {
        window.remove(0);
    }
    if window.len() == RESULT_WINDOW && window.windows(2).all(|w| w[0] == w[1]) {
        window.clear();
        return true;
    }
    false
}

fn outcome_result_json(outcome: &ExecutionOutcome) -> String {
    let value = match outcome.status {
        DispatchStatus::Success => serde_json::json!({
            "output": outcome.output.clone().unwrap_or_default()
        }),
        DispatchStatus::Error => serde_json::json!({
            "error": outcome.error.clone().unwrap_or_else(|| "unknown error".to_owned())
        }),
        DispatchStatus::Interrupted => serde_json::json!({ "error": "interrupted" }),
    };
    value.to_string()
}
