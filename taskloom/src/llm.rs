//! LLM provider abstraction.
//!
//! The engine consumes language models through [`ChatProvider`]: a streaming
//! chat completion returning [`StreamChunk`](crate::stream::StreamChunk)
//! deltas. Concrete adapters (OpenAI-compatible HTTP, local runtimes, test
//! scripts) live outside the engine; they only need to feed a uniform chunk
//! stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use thiserror::Error;

use crate::message::ChatMessage;
use crate::stream::StreamChunk;
use crate::tool::ToolDefinition;

/// A pinned, boxed stream of chunk results as produced by a provider.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// Errors raised by LLM provider adapters.
///
/// The variant determines whether the agent retries the call: transient
/// network failures are retryable with backoff, everything else fails the
/// think phase immediately.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LlmError {
    /// Request or read timed out.
    #[error("LLM request timed out: {message}")]
    Timeout {
        /// The underlying error message.
        message: String,
    },

    /// DNS name resolution failed.
    #[error("LLM DNS resolution failed: {message}")]
    DnsResolution {
        /// The underlying error message.
        message: String,
    },

    /// Connection reset or refused mid-request.
    #[error("LLM connection reset: {message}")]
    ConnectionReset {
        /// The underlying error message.
        message: String,
    },

    /// Provider rejected the request (auth, quota, malformed request).
    #[error("LLM provider error: {message}")]
    Provider {
        /// The underlying error message.
        message: String,
    },

    /// The stream failed after it started.
    #[error("LLM stream error: {message}")]
    Stream {
        /// The underlying error message.
        message: String,
    },
}

impl LlmError {
    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a DNS resolution error.
    #[must_use]
    pub fn dns(message: impl Into<String>) -> Self {
        Self::DnsResolution {
            message: message.into(),
        }
    }

    /// Create a connection reset error.
    #[must_use]
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::ConnectionReset {
            message: message.into(),
        }
    }

    /// Create a provider error.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Create a stream error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Whether the agent should retry this error with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::DnsResolution { .. } | Self::ConnectionReset { .. }
        )
    }
}

/// A chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier, provider-specific.
    pub model: String,
    /// Conversation to complete.
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may call.
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    /// Create a request for the given model.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Set the conversation messages.
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Set the tool definitions.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Append a user message.
    #[must_use]
    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    /// Total character count of the serialized prompt, used for the
    /// recorder's `input_char_count`.
    #[must_use]
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(ChatMessage::char_len).sum()
    }
}

/// Streaming chat completion provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a chat completion request and receive a stream of chunks.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError>;

    /// Get the name of this provider, used in logs and error messages.
    fn provider_name(&self) -> &'static str;

    /// Default model for requests that do not specify one.
    fn default_model(&self) -> &str;

    /// One-shot text completion, used by the memory compression path.
    ///
    /// The default implementation streams a single user prompt and returns
    /// the aggregated text; a mid-stream error fails the completion.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest::new(self.default_model()).user(prompt);
        let input_chars = request.char_count();
        let stream = self.chat_stream(&request).await?;
        let result = crate::stream::collect(stream, input_chars).await;
        match result.last_response {
            Some(error) => Err(LlmError::stream(error)),
            None => Ok(result.effective_text),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::timeout("t").is_retryable());
        assert!(LlmError::dns("d").is_retryable());
        assert!(LlmError::connection_reset("c").is_retryable());
        assert!(!LlmError::provider("p").is_retryable());
        assert!(!LlmError::stream("s").is_retryable());
    }

    #[test]
    fn request_builder_accumulates() {
        let request = ChatRequest::new("test-model")
            .user("hello")
            .user("again");
        assert_eq!(request.model, "test-model");
        assert_eq!(request.messages.len(), 2);
        assert!(request.char_count() > 0);
    }

    #[test]
    fn complete_aggregates_streamed_text() {
        struct OneLiner;

        #[async_trait]
        impl ChatProvider for OneLiner {
            async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChunkStream, LlmError> {
                let chunks: Vec<Result<StreamChunk, LlmError>> =
                    vec![Ok(StreamChunk::text("one ")), Ok(StreamChunk::text("liner"))];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            fn provider_name(&self) -> &'static str {
                "one-liner"
            }
            fn default_model(&self) -> &str {
                "one-liner-model"
            }
        }

        let text = tokio_test::block_on(OneLiner.complete("prompt")).unwrap();
        assert_eq!(text, "one liner");
    }
}
