//! Engine error taxonomy.
//!
//! Subsystem errors ([`LlmError`], [`ToolError`], [`RecorderError`],
//! [`PoolError`]) aggregate into [`EngineError`]. Interruption is modeled
//! as a sentinel variant rather than a failure: it maps to the
//! `INTERRUPTED` status at the step and plan level.

use thiserror::Error;

use crate::llm::LlmError;
use crate::pool::PoolError;
use crate::record::RecorderError;
use crate::tool::ToolError;

/// A type alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The top-level error type for engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// LLM provider error.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Tool resolution or execution error.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Execution recorder error.
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    /// Worker pool error.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Execution was interrupted by a cancellation request.
    #[error("execution was interrupted")]
    Interrupted,

    /// The model produced thinking-only responses past the threshold.
    #[error("early termination threshold reached: {message}")]
    EarlyTermination {
        /// Descriptive message including the attempt count.
        message: String,
    },

    /// All LLM retry attempts were exhausted.
    #[error("LLM retries exhausted: {message}")]
    LlmExhausted {
        /// The latest underlying error message.
        message: String,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// Generic internal error.
    #[error("internal error: {message}")]
    Internal {
        /// The underlying error message.
        message: String,
    },
}

impl EngineError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is the interruption sentinel.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_errors_convert() {
        let err: EngineError = LlmError::timeout("t").into();
        assert!(matches!(err, EngineError::Llm(_)));

        let err: EngineError = ToolError::NotFound("x".to_owned()).into();
        assert!(matches!(err, EngineError::Tool(_)));
    }

    #[test]
    fn interruption_is_a_sentinel() {
        assert!(EngineError::Interrupted.is_interrupted());
        assert!(!EngineError::internal("x").is_interrupted());
    }
}
