//! Taskloom is the runtime core of an autonomous task-execution platform:
//! it turns a user request into a hierarchical plan of ordered steps and
//! drives each step through a ReAct-style agent that calls an LLM and
//! invokes tools until the step completes. Tool calls may spawn nested
//! plans, producing a tree of executions that is tracked, recorded, and
//! reconstructable on demand.

// Identity and context
pub mod context;
pub mod id;

// Errors and configuration
pub mod config;
pub mod error;

// LLM surface
pub mod llm;
pub mod message;
pub mod stream;

// Tools
pub mod tool;
pub mod tools;

// Recording and reads
pub mod record;

// Concurrency and control
pub mod dispatch;
pub mod interrupt;
pub mod memory;
pub mod pool;
pub mod wait;

// Agents and the executor
pub mod agent;
pub mod executor;

pub mod prelude;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use executor::PlanExecutor;
pub use record::{Plan, SqliteRecorder, Step};
