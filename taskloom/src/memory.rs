//! Character-budgeted rolling compression of agent message history.
//!
//! When the working history outgrows its budget, the oldest prefix is
//! summarized through the LLM into a single synthetic message tagged with
//! [`COMPRESSION_SUMMARY_FLAG`]. Pruning is by total character budget after
//! pinning that summary, never by age alone, so the summary survives every
//! later round. A forced path used by the repeated-result loop breaker
//! drops everything except pinned summaries and the last K messages.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::ChatProvider;
use crate::message::ChatMessage;

/// Metadata flag marking the pinned compression summary message.
pub const COMPRESSION_SUMMARY_FLAG: &str = "compression_summary";

/// Rolling memory compressor for agent message histories.
#[derive(Clone)]
pub struct MemoryLimitService {
    provider: Arc<dyn ChatProvider>,
    max_characters: usize,
    retain_recent: usize,
}

impl std::fmt::Debug for MemoryLimitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimitService")
            .field("max_characters", &self.max_characters)
            .field("retain_recent", &self.retain_recent)
            .finish_non_exhaustive()
    }
}

impl MemoryLimitService {
    /// Create a service with the given character budget and forced-path
    /// retention count.
    #[must_use]
    pub fn new(provider: Arc<dyn ChatProvider>, max_characters: usize, retain_recent: usize) -> Self {
        Self {
            provider,
            max_characters,
            retain_recent: retain_recent.max(1),
        }
    }

    /// Total serialized character count of a history.
    #[must_use]
    pub fn total_chars(messages: &[ChatMessage]) -> usize {
        messages.iter().map(ChatMessage::char_len).sum()
    }

    /// Compress the history if it exceeds the budget; otherwise return it
    /// unchanged.
    ///
    /// The oldest prefix is summarized into one pinned message and the
    /// recent suffix is kept verbatim. If the summarizing LLM call fails,
    /// the input is returned unchanged — the agent proceeds and may hit
    /// the model's own limit later.
    pub async fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let total = Self::total_chars(&messages);
        if total <= self.max_characters {
            return messages;
        }

        // Keep a recent suffix within half the budget; the summary gets
        // the remaining headroom.
        let suffix_budget = self.max_characters / 2;
        let mut suffix_chars = 0;
        let mut split = messages.len();
        while split > 0 {
            let len = messages[split - 1].char_len();
            if suffix_chars + len > suffix_budget {
                break;
            }
            suffix_chars += len;
            split -= 1;
        }
        // Always keep at least the most recent message verbatim.
        if split == messages.len() {
            split = messages.len() - 1;
        }

        let (prefix, suffix) = messages.split_at(split);
        debug!(
            total,
            budget = self.max_characters,
            compressed = prefix.len(),
            kept = suffix.len(),
            "Compressing agent memory"
        );

        match self.summarize(prefix).await {
            Ok(summary) => {
                let mut compressed = Vec::with_capacity(suffix.len() + 1);
                compressed.push(
                    ChatMessage::assistant(format!(
                        "[Conversation summary of {} earlier messages]\n{summary}",
                        prefix.len()
                    ))
                    .with_flag(COMPRESSION_SUMMARY_FLAG),
                );
                compressed.extend_from_slice(suffix);
                compressed
            }
            Err(error) => {
                warn!(%error, "Memory compression failed; keeping history unchanged");
                messages
            }
        }
    }

    /// Forced compression used by the repeated-result loop breaker: keep
    /// pinned summaries plus the last K messages, no LLM call.
    #[must_use]
    pub fn force_compress(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let len = messages.len();
        if len <= self.retain_recent {
            return messages;
        }
        let cutoff = len - self.retain_recent;
        messages
            .into_iter()
            .enumerate()
            .filter(|(index, message)| {
                *index >= cutoff || message.has_flag(COMPRESSION_SUMMARY_FLAG)
            })
            .map(|(_, message)| message)
            .collect()
    }

    async fn summarize(&self, prefix: &[ChatMessage]) -> Result<String, crate::llm::LlmError> {
        let mut rendered = String::new();
        for message in prefix {
            rendered.push_str(message.role.as_str());
            rendered.push_str(": ");
            if let Some(content) = &message.content {
                rendered.push_str(content);
            }
            for call in &message.tool_calls {
                rendered.push_str(&format!(" [called {} with {}]", call.name, call.arguments));
            }
            rendered.push('\n');
        }

        let prompt = format!(
            "Summarize the following agent conversation so execution can \
             continue with the summary in place of the original messages. \
             Preserve tool outcomes, decisions, and open items.\n\n{rendered}"
        );
        self.provider.complete(&prompt).await
    }
}
