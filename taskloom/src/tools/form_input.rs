//! Form-input tool: suspend the step until a human answers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use super::FORM_INPUT_TOOL;
use crate::context::ToolContext;
use crate::interrupt::InterruptionManager;
use crate::tool::{Tool, ToolError, ToolExecuteResult, parse_arguments};
use crate::wait::{FormState, PendingForm, UserInputWaitRegistry};

/// Interval between wait-state polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interruption checks happen at least this often while waiting.
const INTERRUPT_CHECK_CADENCE: Duration = Duration::from_secs(2);

/// Asks the user for structured input and waits for the submission.
///
/// Registers a [`PendingForm`] in the wait registry (one per root plan,
/// serialized across sub-plans) and polls until the user submits, the
/// configured timeout passes, or the plan is interrupted. A timeout is a
/// recoverable observation, not an error.
pub struct FormInputTool {
    registry: Arc<UserInputWaitRegistry>,
    interrupter: Arc<InterruptionManager>,
    timeout: Duration,
}

impl std::fmt::Debug for FormInputTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormInputTool")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct FormInputArgs {
    #[serde(default)]
    title: Option<String>,
    /// Description of the requested inputs, passed through to the client.
    inputs: Value,
}

impl FormInputTool {
    /// Create the tool over the shared registry and interruption manager.
    #[must_use]
    pub fn new(
        registry: Arc<UserInputWaitRegistry>,
        interrupter: Arc<InterruptionManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            interrupter,
            timeout,
        }
    }

    async fn wait_for_submission(
        &self,
        form: &Arc<PendingForm>,
        root_plan_id: &str,
    ) -> Result<FormState, ToolError> {
        let deadline = Instant::now() + self.timeout;
        let mut last_interrupt_check = Instant::now();

        loop {
            form.wait_changed(POLL_INTERVAL).await;

            match form.state() {
                FormState::InputReceived => return Ok(FormState::InputReceived),
                FormState::InputTimeout => return Ok(FormState::InputTimeout),
                FormState::Idle | FormState::AwaitingUserInput => {}
            }

            if last_interrupt_check.elapsed() >= INTERRUPT_CHECK_CADENCE {
                last_interrupt_check = Instant::now();
                if !self.interrupter.should_continue(root_plan_id) {
                    return Err(ToolError::Interrupted);
                }
            }

            if Instant::now() >= deadline {
                form.mark_timeout();
                return Ok(FormState::InputTimeout);
            }
        }
    }
}

#[async_trait]
impl Tool for FormInputTool {
    fn name(&self) -> &str {
        FORM_INPUT_TOOL
    }

    fn description(&self) -> String {
        "Ask the user for input through a form and wait for the \
         submission. Use when required information cannot be derived from \
         the task itself."
            .to_owned()
    }

    fn parameters_schema(&self) -> String {
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short title shown above the form"
                },
                "inputs": {
                    "type": "array",
                    "description": "Requested fields",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "label": { "type": "string" }
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["inputs"]
        })
        .to_string()
    }

    async fn execute(
        &self,
        arguments: &str,
        ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError> {
        let args: FormInputArgs = parse_arguments(arguments)?;
        let title = args.title.unwrap_or_else(|| "User input required".to_owned());
        let form = Arc::new(PendingForm::new(title, args.inputs));

        let acquired = self
            .registry
            .store_exclusive(&ctx.root_plan_id, Arc::clone(&form), &ctx.current_plan_id)
            .await;
        if !acquired {
            return Ok(ToolExecuteResult::new(
                "Form input unavailable: another form request currently \
                 holds the slot for this plan. Retry later or proceed \
                 without user input.",
            ));
        }
        info!(
            root_plan_id = %ctx.root_plan_id,
            plan_id = %ctx.current_plan_id,
            "Awaiting user form input"
        );

        match self.wait_for_submission(&form, &ctx.root_plan_id).await? {
            FormState::InputReceived => {
                self.registry.release_received(&ctx.root_plan_id).await;
                let payload = form.payload().unwrap_or(Value::Null);
                Ok(ToolExecuteResult::new(format!(
                    "User input received: {payload}"
                )))
            }
            _ => Ok(ToolExecuteResult::new(
                "Form input timed out: the user did not respond within the \
                 configured window. Proceed without the requested input or \
                 report the step as blocked.",
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::ExecutionContext;

    fn harness(timeout: Duration) -> (Arc<UserInputWaitRegistry>, FormInputTool, ToolContext) {
        let registry = Arc::new(UserInputWaitRegistry::new(Duration::from_millis(200)));
        let interrupter = Arc::new(InterruptionManager::new());
        let tool = FormInputTool::new(Arc::clone(&registry), interrupter, timeout);
        let plan = ExecutionContext::root("plan-1", "req");
        let ctx = ToolContext::for_call(&plan, "toolcall-1");
        (registry, tool, ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn submission_feeds_payload_back() {
        let (registry, tool, ctx) = harness(Duration::from_secs(60));

        let exec = tokio::spawn(async move {
            tool.execute(r#"{"inputs": [{"name": "city"}]}"#, &ctx).await
        });

        // Let the tool register, then submit.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.submit("plan-1", json!({"city": "Berlin"})).await);

        let result = exec.await.unwrap().unwrap();
        assert!(result.output.contains("Berlin"));
        // The slot is freed after consumption.
        assert!(registry.get_wait_state("plan-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_recoverable_observation() {
        let (registry, tool, ctx) = harness(Duration::from_secs(2));

        let result = tool
            .execute(r#"{"inputs": []}"#, &ctx)
            .await
            .unwrap();
        assert!(result.output.contains("timed out"));

        // Slot retained for late submissions.
        let state = registry.get_wait_state("plan-1").await.unwrap();
        assert!(!state.waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_aborts_the_wait() {
        let (_registry, tool, ctx) = harness(Duration::from_secs(600));
        tool.interrupter.register("plan-1");

        let interrupter = Arc::clone(&tool.interrupter);
        let exec = tokio::spawn(async move {
            tool.execute(r#"{"inputs": []}"#, &ctx).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        interrupter.request("plan-1");
        tokio::time::sleep(Duration::from_secs(3)).await;

        let err = exec.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Interrupted));
    }
}
