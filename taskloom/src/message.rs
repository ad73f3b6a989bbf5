//! Message types for agent-model communication.
//!
//! The agent loop keeps its working history as a list of chat messages in
//! the completion-API convention: a system prompt, user turns, assistant
//! turns (optionally carrying tool calls), and tool-response turns linked
//! back by the provider's tool-call id.
//!
//! Messages carry an optional metadata map. The memory limit service uses it
//! to pin its compression summary so pruning never drops it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool response message.
    Tool,
}

impl MessageRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call made by the model.
///
/// `arguments` is kept as the raw JSON string the model produced; tools
/// parse it themselves so malformed arguments surface as tool errors rather
/// than transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier the provider assigned to this call.
    pub id: String,
    /// Qualified tool name (`service_group-tool_name`).
    pub name: String,
    /// Raw JSON arguments string.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// A chat message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: MessageRole,
    /// Text content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls made by the model (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Provider tool-call id this message responds to (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Free-form marker flags; pruning-sensitive messages are tagged here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ChatMessage {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    /// Create a new assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    /// Create a new assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a new tool response message.
    #[must_use]
    pub fn tool_response(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            metadata: BTreeMap::new(),
        }
    }

    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Tag this message with a metadata flag.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), "true".to_owned());
        self
    }

    /// Check whether a metadata flag is set.
    #[must_use]
    pub fn has_flag(&self, key: &str) -> bool {
        self.metadata.get(key).is_some_and(|v| v == "true")
    }

    /// Append text to the message content.
    pub fn append_content(&mut self, suffix: &str) {
        match &mut self.content {
            Some(content) => {
                content.push('\n');
                content.push_str(suffix);
            }
            None => self.content = Some(suffix.to_owned()),
        }
    }

    /// Check if this message has tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Serialized character length, used for memory budgeting.
    #[must_use]
    pub fn char_len(&self) -> usize {
        serde_json::to_string(self).map_or(0, |s| s.chars().count())
    }
}
