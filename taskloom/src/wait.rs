//! Human-in-the-loop form-input waits.
//!
//! At most one pending form exists per root plan: sub-plans contending for
//! user attention are serialized by [`UserInputWaitRegistry::store_exclusive`],
//! which polls for the slot with a timeout. A pending form times out into
//! `INPUT_TIMEOUT` but stays in the registry until plan teardown so a late
//! submission is still observable; only `AWAITING_USER_INPUT →
//! INPUT_RECEIVED` feeds data back to the waiting agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// State machine of a form-input request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormState {
    /// Created, not yet registered.
    Idle,
    /// Registered and waiting for the user.
    AwaitingUserInput,
    /// The user submitted while the agent was waiting.
    InputReceived,
    /// The wait deadline passed without a submission.
    InputTimeout,
}

/// One pending form-input request.
///
/// Shared between the waiting agent (via the form tool) and the registry;
/// submissions flip the state and wake the waiter through the notify
/// handle.
#[derive(Debug)]
pub struct PendingForm {
    title: String,
    form_schema: Value,
    state: Mutex<FormState>,
    payload: Mutex<Option<Value>>,
    notify: Notify,
}

impl PendingForm {
    /// Create an idle form with a title and input schema for the client.
    #[must_use]
    pub fn new(title: impl Into<String>, form_schema: Value) -> Self {
        Self {
            title: title.into(),
            form_schema,
            state: Mutex::new(FormState::Idle),
            payload: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FormState {
        self.state.lock().map_or(FormState::Idle, |s| *s)
    }

    /// The submitted payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<Value> {
        self.payload.lock().ok().and_then(|p| p.clone())
    }

    /// Title shown to the user.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Input schema shown to the user.
    #[must_use]
    pub const fn form_schema(&self) -> &Value {
        &self.form_schema
    }

    /// Wait for a state change or the given interval, whichever first.
    pub async fn wait_changed(&self, interval: Duration) {
        let _ = tokio::time::timeout(interval, self.notify.notified()).await;
    }

    fn transition_awaiting(&self) {
        if let Ok(mut state) = self.state.lock()
            && *state == FormState::Idle
        {
            *state = FormState::AwaitingUserInput;
        }
    }

    /// Record the wait deadline passing. Only an awaiting form times out.
    pub fn mark_timeout(&self) {
        if let Ok(mut state) = self.state.lock()
            && *state == FormState::AwaitingUserInput
        {
            *state = FormState::InputTimeout;
        }
        self.notify.notify_waiters();
    }

    /// Apply a user submission.
    ///
    /// While awaiting, this transitions to `INPUT_RECEIVED` and feeds the
    /// payload back to the agent. After a timeout the payload is still
    /// stored for observers, but the state stays `INPUT_TIMEOUT` and the
    /// step is not resurrected.
    pub fn submit(&self, payload: Value) {
        if let Ok(mut stored) = self.payload.lock() {
            *stored = Some(payload);
        }
        if let Ok(mut state) = self.state.lock()
            && *state == FormState::AwaitingUserInput
        {
            *state = FormState::InputReceived;
        }
        self.notify.notify_waiters();
    }
}

/// Client-facing snapshot of a pending form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitState {
    /// Plan that raised the form.
    pub plan_id: String,
    /// Form title.
    pub title: String,
    /// Whether the form is still awaiting user input.
    pub waiting: bool,
    /// Submitted values, once present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_inputs: Option<Value>,
}

#[derive(Debug)]
struct Slot {
    current_plan_id: String,
    form: Arc<PendingForm>,
}

/// Registry of pending form-input requests, keyed by root plan id.
#[derive(Debug)]
pub struct UserInputWaitRegistry {
    slots: tokio::sync::Mutex<HashMap<String, Slot>>,
    lock_timeout: Duration,
}

impl UserInputWaitRegistry {
    /// Create a registry whose exclusive-store attempts give up after
    /// `lock_timeout`.
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            slots: tokio::sync::Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Acquire the exclusive form slot for a root plan.
    ///
    /// Polls until the slot frees up or `lock_timeout` passes; returns
    /// `false` on timeout. On success the form transitions to
    /// `AWAITING_USER_INPUT`.
    pub async fn store_exclusive(
        &self,
        root_plan_id: &str,
        form: Arc<PendingForm>,
        current_plan_id: &str,
    ) -> bool {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            {
                let mut slots = self.slots.lock().await;
                if !slots.contains_key(root_plan_id) {
                    form.transition_awaiting();
                    slots.insert(
                        root_plan_id.to_owned(),
                        Slot {
                            current_plan_id: current_plan_id.to_owned(),
                            form,
                        },
                    );
                    debug!(root_plan_id, current_plan_id, "Form slot acquired");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                info!(root_plan_id, "Form slot acquisition timed out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Complete the pending form with user data.
    ///
    /// Late submissions after a timeout are accepted and stored; returns
    /// `false` when no form is registered for the root.
    pub async fn submit(&self, root_plan_id: &str, payload: Value) -> bool {
        let slots = self.slots.lock().await;
        match slots.get(root_plan_id) {
            Some(slot) => {
                slot.form.submit(payload);
                info!(root_plan_id, "Form submission applied");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the pending form for clients.
    pub async fn get_wait_state(&self, root_plan_id: &str) -> Option<WaitState> {
        let slots = self.slots.lock().await;
        slots.get(root_plan_id).map(|slot| WaitState {
            plan_id: slot.current_plan_id.clone(),
            title: slot.form.title().to_owned(),
            waiting: slot.form.state() == FormState::AwaitingUserInput,
            form_inputs: slot.form.payload(),
        })
    }

    /// Free the slot after a received submission was consumed.
    ///
    /// A timed-out form is deliberately not released here; it stays until
    /// [`remove`](Self::remove) so late submissions remain observable.
    pub async fn release_received(&self, root_plan_id: &str) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(root_plan_id)
            .is_some_and(|slot| slot.form.state() == FormState::InputReceived)
        {
            slots.remove(root_plan_id);
        }
    }

    /// Drop the slot at plan teardown, whatever its state.
    pub async fn remove(&self, root_plan_id: &str) {
        let mut slots = self.slots.lock().await;
        slots.remove(root_plan_id);
    }
}
