//! Streaming response handling for LLM calls.
//!
//! The agent consumes model output as a lazy stream of [`StreamChunk`]
//! deltas and merges them into a single [`StreamingResult`]. Partial
//! tool-call arguments are merged by tool-call id: a later chunk with the
//! same id appends to the accumulated arguments. The only subtle part of
//! the whole pipeline lives here, so the merge logic carries its own tests.

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};

use crate::llm::{ChunkStream, LlmError};
use crate::message::ToolCall;

/// A chunk of streaming response from an LLM provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Text content delta.
    Text {
        /// The text delta.
        delta: String,
    },

    /// Start of a tool call. The id establishes identity for later deltas.
    ToolCallStart {
        /// Provider-assigned identifier for this tool call.
        id: String,
        /// Qualified name of the tool being called.
        name: String,
    },

    /// Partial arguments for an in-progress tool call.
    ToolCallDelta {
        /// Id of the tool call being extended.
        id: String,
        /// Partial JSON arguments.
        partial_json: String,
    },

    /// Stream is complete.
    Done,

    /// Error raised mid-stream by the provider.
    Error {
        /// Error message.
        message: String,
    },
}

impl StreamChunk {
    /// Creates a text chunk.
    #[inline]
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text {
            delta: delta.into(),
        }
    }

    /// Creates a tool call start chunk.
    #[must_use]
    pub fn tool_call_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolCallStart {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Creates a tool call delta chunk.
    #[must_use]
    pub fn tool_call_delta(id: impl Into<String>, partial_json: impl Into<String>) -> Self {
        Self::ToolCallDelta {
            id: id.into(),
            partial_json: partial_json.into(),
        }
    }

    /// Creates an error chunk.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// The merged outcome of one streamed LLM response.
#[derive(Debug, Clone, Default)]
pub struct StreamingResult {
    /// Full text aggregated across all text deltas.
    pub effective_text: String,
    /// Tool calls with fully merged arguments, in arrival order.
    pub effective_tool_calls: Vec<ToolCall>,
    /// Terminal status of the stream; carries the error message when the
    /// stream failed part-way. `None` means the stream ended cleanly.
    pub last_response: Option<String>,
    /// Character count of the prompt that produced this response.
    pub input_char_count: usize,
    /// Character count of the merged response text.
    pub output_char_count: usize,
    /// True when the response contains non-empty text and zero tool calls:
    /// the model "thought" without acting.
    pub early_terminated: bool,
}

impl StreamingResult {
    /// True when the stream surfaced an error.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.last_response.is_some()
    }
}

#[derive(Debug, Clone)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Aggregator that merges stream chunks into a [`StreamingResult`].
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    text: String,
    tool_calls: Vec<ToolCallBuilder>,
    error: Option<String>,
}

impl StreamAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a stream chunk to the aggregator.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text { delta } => self.text.push_str(delta),
            StreamChunk::ToolCallStart { id, name } => {
                // A repeated start with a known id re-opens the same call.
                if !self.tool_calls.iter().any(|tc| tc.id == *id) {
                    self.tool_calls.push(ToolCallBuilder {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    });
                }
            }
            StreamChunk::ToolCallDelta { id, partial_json } => {
                if let Some(tc) = self.tool_calls.iter_mut().find(|tc| tc.id == *id) {
                    tc.arguments.push_str(partial_json);
                }
            }
            StreamChunk::Error { message } => self.error = Some(message.clone()),
            StreamChunk::Done => {}
        }
    }

    /// Records a transport-level stream error.
    pub fn record_error(&mut self, error: &LlmError) {
        self.error = Some(error.to_string());
    }

    /// Finishes aggregation, computing char counts and the
    /// early-termination flag.
    #[must_use]
    pub fn finish(self, input_char_count: usize) -> StreamingResult {
        let effective_tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.name, tc.arguments))
            .collect();
        let output_char_count = self.text.chars().count();
        let early_terminated = !self.text.is_empty() && effective_tool_calls.is_empty();

        StreamingResult {
            effective_text: self.text,
            effective_tool_calls,
            last_response: self.error,
            input_char_count,
            output_char_count,
            early_terminated,
        }
    }
}

/// Consumes an entire chunk stream into a [`StreamingResult`].
///
/// The stream is drained to the end even after an error item; whatever was
/// aggregated up to that point is returned with the error surfaced in
/// [`StreamingResult::last_response`].
pub async fn collect(mut stream: ChunkStream, input_char_count: usize) -> StreamingResult {
    let mut aggregator = StreamAggregator::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => aggregator.apply(&chunk),
            Err(err) => aggregator.record_error(&err),
        }
    }
    aggregator.finish(input_char_count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod aggregator {
        use super::*;

        #[test]
        fn text_accumulates_across_chunks() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::text("Hello"));
            agg.apply(&StreamChunk::text(" world"));
            let result = agg.finish(10);
            assert_eq!(result.effective_text, "Hello world");
            assert_eq!(result.output_char_count, 11);
            assert_eq!(result.input_char_count, 10);
        }

        #[test]
        fn tool_arguments_merge_by_id() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::tool_call_start("call_1", "fs-write"));
            agg.apply(&StreamChunk::tool_call_delta("call_1", r#"{"path":"#));
            agg.apply(&StreamChunk::tool_call_delta("call_1", r#""a.txt"}"#));
            let result = agg.finish(0);

            assert_eq!(result.effective_tool_calls.len(), 1);
            let call = &result.effective_tool_calls[0];
            assert_eq!(call.id, "call_1");
            assert_eq!(call.name, "fs-write");
            assert_eq!(call.arguments, r#"{"path":"a.txt"}"#);
        }

        #[test]
        fn interleaved_deltas_stay_separate() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::tool_call_start("call_1", "tool_a"));
            agg.apply(&StreamChunk::tool_call_start("call_2", "tool_b"));
            agg.apply(&StreamChunk::tool_call_delta("call_2", r#"{"b":2}"#));
            agg.apply(&StreamChunk::tool_call_delta("call_1", r#"{"a":1}"#));
            let result = agg.finish(0);

            assert_eq!(result.effective_tool_calls.len(), 2);
            assert_eq!(result.effective_tool_calls[0].arguments, r#"{"a":1}"#);
            assert_eq!(result.effective_tool_calls[1].arguments, r#"{"b":2}"#);
        }

        #[test]
        fn delta_without_start_is_ignored() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::tool_call_delta("unknown", "{}"));
            let result = agg.finish(0);
            assert!(result.effective_tool_calls.is_empty());
        }

        #[test]
        fn duplicate_start_does_not_reset_arguments() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::tool_call_start("call_1", "tool_a"));
            agg.apply(&StreamChunk::tool_call_delta("call_1", "{\"x\""));
            agg.apply(&StreamChunk::tool_call_start("call_1", "tool_a"));
            agg.apply(&StreamChunk::tool_call_delta("call_1", ":1}"));
            let result = agg.finish(0);
            assert_eq!(result.effective_tool_calls[0].arguments, "{\"x\":1}");
        }
    }

    mod early_termination {
        use super::*;

        #[test]
        fn text_without_tool_calls_terminates_early() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::text("I think the answer is 42."));
            agg.apply(&StreamChunk::Done);
            assert!(agg.finish(0).early_terminated);
        }

        #[test]
        fn tool_calls_suppress_early_termination() {
            let mut agg = StreamAggregator::new();
            agg.apply(&StreamChunk::text("Let me check."));
            agg.apply(&StreamChunk::tool_call_start("call_1", "fs-read"));
            agg.apply(&StreamChunk::tool_call_delta("call_1", "{}"));
            assert!(!agg.finish(0).early_terminated);
        }

        #[test]
        fn empty_response_is_not_early_terminated() {
            let agg = StreamAggregator::new();
            assert!(!agg.finish(0).early_terminated);
        }
    }

    mod errors {
        use futures::stream;

        use super::*;

        #[tokio::test]
        async fn stream_error_surfaces_with_partial_aggregate() {
            let chunks: Vec<Result<StreamChunk, LlmError>> = vec![
                Ok(StreamChunk::text("partial")),
                Err(LlmError::timeout("read timed out")),
                Ok(StreamChunk::text(" text")),
            ];
            let result = collect(Box::pin(stream::iter(chunks)), 5).await;

            // The whole stream is consumed; text after the error is kept.
            assert_eq!(result.effective_text, "partial text");
            assert!(result.has_error());
            assert!(result.last_response.unwrap().contains("read timed out"));
        }

        #[tokio::test]
        async fn error_chunk_is_surfaced() {
            let chunks: Vec<Result<StreamChunk, LlmError>> =
                vec![Ok(StreamChunk::error("provider overloaded"))];
            let result = collect(Box::pin(stream::iter(chunks)), 0).await;
            assert_eq!(result.last_response.as_deref(), Some("provider overloaded"));
        }
    }
}
