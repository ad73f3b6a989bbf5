//! Cooperative cancellation, keyed by root plan.
//!
//! Interruption is a poll, never a forced abort: every component of a
//! running plan tree checks [`InterruptionManager::should_continue`] at its
//! safe points (before each step, before each agent retry, before each tool
//! dispatch, periodically while waiting for user input) and propagates by
//! returning the interrupted sentinel. In-flight tool calls finish or hit
//! their own timeouts.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

/// Lifecycle of one root plan's cancellation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The plan tree is running normally.
    Running,
    /// A caller asked the tree to stop; safe points will observe it.
    InterruptRequested,
    /// The tree has wound down.
    Terminated,
}

/// Per-root cooperative cancellation flags.
#[derive(Debug, Default)]
pub struct InterruptionManager {
    inner: Mutex<HashMap<String, RunState>>,
}

impl InterruptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root plan as running. Idempotent.
    pub fn register(&self, root_plan_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .entry(root_plan_id.to_owned())
                .or_insert(RunState::Running);
        }
    }

    /// Request cancellation of a root plan tree.
    ///
    /// Returns `true` when the plan was running and the request was
    /// recorded; `false` for unknown or already-terminated plans.
    pub fn request(&self, root_plan_id: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.get_mut(root_plan_id) {
            Some(state @ RunState::Running) => {
                *state = RunState::InterruptRequested;
                info!(root_plan_id, "Interruption requested");
                true
            }
            Some(RunState::InterruptRequested) => true,
            _ => false,
        }
    }

    /// Safe-point check. Returns `false` once interruption was requested.
    ///
    /// Unregistered roots continue: a plan that never registered cannot
    /// have been interrupted.
    #[must_use]
    pub fn should_continue(&self, root_plan_id: &str) -> bool {
        self.inner.lock().is_ok_and(|inner| {
            !matches!(
                inner.get(root_plan_id),
                Some(RunState::InterruptRequested | RunState::Terminated)
            )
        })
    }

    /// Mark a root plan tree as wound down.
    pub fn terminate(&self, root_plan_id: &str) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some(state) = inner.get_mut(root_plan_id)
        {
            *state = RunState::Terminated;
        }
    }

    /// Drop a root plan's flag at teardown.
    pub fn remove(&self, root_plan_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(root_plan_id);
        }
    }

    /// Current state of a root plan's flag.
    #[must_use]
    pub fn state(&self, root_plan_id: &str) -> Option<RunState> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(root_plan_id).copied())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn running_plans_continue() {
        let manager = InterruptionManager::new();
        manager.register("plan-1");
        assert!(manager.should_continue("plan-1"));
        assert_eq!(manager.state("plan-1"), Some(RunState::Running));
    }

    #[test]
    fn unregistered_plans_continue() {
        let manager = InterruptionManager::new();
        assert!(manager.should_continue("plan-unknown"));
        assert!(manager.state("plan-unknown").is_none());
    }

    #[test]
    fn request_flips_the_flag() {
        let manager = InterruptionManager::new();
        manager.register("plan-1");
        assert!(manager.request("plan-1"));
        assert!(!manager.should_continue("plan-1"));
        // Repeated requests stay acknowledged.
        assert!(manager.request("plan-1"));
    }

    #[test]
    fn request_on_unknown_plan_is_refused() {
        let manager = InterruptionManager::new();
        assert!(!manager.request("plan-unknown"));
    }

    #[test]
    fn terminate_and_remove_tear_down() {
        let manager = InterruptionManager::new();
        manager.register("plan-1");
        manager.terminate("plan-1");
        assert_eq!(manager.state("plan-1"), Some(RunState::Terminated));
        assert!(!manager.should_continue("plan-1"));
        assert!(!manager.request("plan-1"));

        manager.remove("plan-1");
        assert!(manager.state("plan-1").is_none());
    }

    #[test]
    fn roots_are_independent() {
        let manager = InterruptionManager::new();
        manager.register("plan-1");
        manager.register("plan-2");
        manager.request("plan-1");
        assert!(!manager.should_continue("plan-1"));
        assert!(manager.should_continue("plan-2"));
    }
}
