//! Agent profiles and step-to-agent selection.
//!
//! A step requirement may begin with an `[AGENT_TAG]` naming the profile
//! that should execute it; untagged steps go to the default profile.

use serde::{Deserialize, Serialize};

/// Configuration of one executor agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Name referenced by `[AGENT_TAG]` prefixes.
    pub name: String,
    /// Short description recorded with each execution.
    pub description: String,
    /// System prompt for the agent's LLM calls.
    pub system_prompt: String,
    /// Per-step round limit override; the engine default applies when
    /// absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    /// Model override; the engine default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentProfile {
    /// Create a profile with name, description, and system prompt.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            max_steps: None,
            model: None,
        }
    }

    /// Override the per-step round limit.
    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Override the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Split a step requirement into its optional `[AGENT_TAG]` and the
/// remaining requirement text.
#[must_use]
pub fn parse_agent_tag(requirement: &str) -> (Option<&str>, &str) {
    let trimmed = requirement.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        let tag = &rest[..end];
        if !tag.is_empty() && !tag.contains(char::is_whitespace) {
            return (Some(tag), rest[end + 1..].trim_start());
        }
    }
    (None, requirement)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn tagged_requirement_splits() {
        let (tag, rest) = parse_agent_tag("[BROWSER_AGENT] open the page");
        assert_eq!(tag, Some("BROWSER_AGENT"));
        assert_eq!(rest, "open the page");
    }

    #[test]
    fn untagged_requirement_passes_through() {
        let (tag, rest) = parse_agent_tag("just do it");
        assert_eq!(tag, None);
        assert_eq!(rest, "just do it");
    }

    #[test]
    fn bracketed_prose_is_not_a_tag() {
        let (tag, _) = parse_agent_tag("[not a tag] text");
        assert_eq!(tag, None);
    }

    #[test]
    fn empty_brackets_are_not_a_tag() {
        let (tag, rest) = parse_agent_tag("[] text");
        assert_eq!(tag, None);
        assert_eq!(rest, "[] text");
    }

    #[test]
    fn leading_whitespace_is_tolerated() {
        let (tag, rest) = parse_agent_tag("  [WORKER] trim me");
        assert_eq!(tag, Some("WORKER"));
        assert_eq!(rest, "trim me");
    }
}
