//! Process-wide identity dispatcher.
//!
//! Every plan, step, think-act cycle, tool call, and parallel dispatch gets
//! an opaque string id with a distinguishing prefix. Ids combine the
//! millisecond timestamp, a process-wide monotonic counter, and a short
//! random suffix, so they are unique within a process lifetime and remain
//! readable in logs and database rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
///
/// Shared by the id dispatcher and the execution recorder so all persisted
/// timestamps use the same clock representation.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..4)
        .map(|_| char::from(ALPHABET[fastrand::usize(..ALPHABET.len())]))
        .collect()
}

fn next(prefix: &str) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq}-{}", now_millis(), random_suffix())
}

/// Issues unique, prefixed string ids for every execution entity.
#[derive(Debug, Clone, Copy)]
pub struct Ids;

impl Ids {
    /// New `plan-` id for a root or sub-plan.
    #[must_use]
    pub fn new_plan_id() -> String {
        next("plan")
    }

    /// New `step-` id for one step of a plan.
    #[must_use]
    pub fn new_step_id() -> String {
        next("step")
    }

    /// New `thinkact-` id for one think-act cycle.
    #[must_use]
    pub fn new_think_act_id() -> String {
        next("thinkact")
    }

    /// New `toolcall-` id for one tool invocation.
    #[must_use]
    pub fn new_tool_call_id() -> String {
        next("toolcall")
    }

    /// New `par-` id for one parallel dispatch batch.
    #[must_use]
    pub fn new_parallel_exec_id() -> String {
        next("par")
    }
}
