//! Tool trait and registry.
//!
//! Tools are the agent's only way to act on the world. Each tool exposes a
//! qualified name (`service_group-tool_name`), a JSON schema for its input,
//! and an async execution entry point that receives a [`ToolContext`]
//! carrying the invocation's identity. Tools that can end a step report
//! `can_terminate() == true`; tools with observable environment state
//! contribute a [`ToolState`] snapshot to the agent's prompt.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::ToolContext;

/// Errors raised when resolving or executing a tool.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool registered under the given qualified name.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// Tool arguments failed to parse or validate.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Tool execution failed.
    #[error("tool '{tool_name}' failed: {message}")]
    Execution {
        /// Name of the tool that failed.
        tool_name: String,
        /// The underlying error message.
        message: String,
    },

    /// Execution was abandoned because the plan was interrupted.
    #[error("tool execution interrupted")]
    Interrupted,
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }
}

/// Definition of a tool for LLM function calling.
///
/// Serializes to the chat-completions function format:
/// `{"type": "function", "function": {"name", "description", "parameters"}}`.
/// The parameter schema is carried as a string and embedded verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    /// Qualified tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema for the tool's input, as a string.
    pub parameters: String,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: parameters.into(),
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let parameters: Value = serde_json::from_str(&self.parameters)
            .unwrap_or_else(|_| Value::String(self.parameters.clone()));

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), parameters);

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// Environment snapshot a tool contributes to the agent's prompt.
///
/// Snapshots are deduplicated by `key`: two browser tools sharing one
/// browser session report the same key and only one snapshot is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolState {
    /// Deduplication key.
    pub key: String,
    /// Human-readable state description.
    pub state_string: String,
}

impl ToolState {
    /// Create a new tool state snapshot.
    #[must_use]
    pub fn new(key: impl Into<String>, state_string: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state_string: state_string.into(),
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecuteResult {
    /// Output string handed back to the model as the observation.
    pub output: String,
}

impl ToolExecuteResult {
    /// Create a new result.
    #[must_use]
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// The capability interface every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Qualified name (`service_group-tool_name`) the LLM calls this tool by.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> String;

    /// JSON schema for the tool's input, as a string.
    fn parameters_schema(&self) -> String;

    /// Execute the tool.
    ///
    /// `arguments` is the raw JSON string produced by the model; tools parse
    /// it themselves and surface malformed input as
    /// [`ToolError::InvalidArguments`].
    async fn execute(
        &self,
        arguments: &str,
        ctx: &ToolContext,
    ) -> Result<ToolExecuteResult, ToolError>;

    /// Optional environment snapshot for the agent prompt.
    fn current_state(&self) -> Option<ToolState> {
        None
    }

    /// Whether a successful call of this tool ends the step.
    fn can_terminate(&self) -> bool {
        false
    }

    /// Release per-plan resources. Called once at plan end.
    async fn cleanup(&self, _plan_id: &str) {}

    /// Definition for LLM function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }
}

/// Helper for tools: parse a JSON argument string into a typed value.
pub fn parse_arguments<T: for<'de> Deserialize<'de>>(arguments: &str) -> Result<T, ToolError> {
    serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// The per-plan tool callback map.
///
/// Built once per plan invocation at bootstrap; never mutated afterwards.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its qualified name. Replaces any previous
    /// registration of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Resolve a tool by qualified name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions of all registered tools, sorted by name for a stable
    /// prompt layout.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Environment snapshots from all tools, deduplicated by key and
    /// sorted for a stable prompt layout.
    #[must_use]
    pub fn tool_states(&self) -> Vec<ToolState> {
        let mut by_key: HashMap<String, ToolState> = HashMap::new();
        for tool in self.tools.values() {
            if let Some(state) = tool.current_state() {
                by_key.entry(state.key.clone()).or_insert(state);
            }
        }
        let mut states: Vec<ToolState> = by_key.into_values().collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }

    /// Run every tool's cleanup hook for the given plan.
    pub async fn cleanup_all(&self, plan_id: &str) {
        for tool in self.tools.values() {
            tool.cleanup(plan_id).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::context::{ExecutionContext, ToolContext};

    #[derive(Debug, Deserialize)]
    struct EchoArgs {
        message: String,
    }

    struct EchoTool {
        state_key: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "test-echo"
        }

        fn description(&self) -> String {
            "Echoes back the input message.".to_owned()
        }

        fn parameters_schema(&self) -> String {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" }
                },
                "required": ["message"]
            })
            .to_string()
        }

        async fn execute(
            &self,
            arguments: &str,
            _ctx: &ToolContext,
        ) -> Result<ToolExecuteResult, ToolError> {
            let args: EchoArgs = parse_arguments(arguments)?;
            Ok(ToolExecuteResult::new(args.message))
        }

        fn current_state(&self) -> Option<ToolState> {
            Some(ToolState::new(self.state_key, "echo ready"))
        }
    }

    fn test_ctx() -> ToolContext {
        let plan = ExecutionContext::root("plan-1", "req");
        ToolContext::for_call(&plan, "toolcall-1")
    }

    #[tokio::test]
    async fn execute_parses_arguments() {
        let tool = EchoTool { state_key: "echo" };
        let result = tool
            .execute(r#"{"message":"hi"}"#, &test_ctx())
            .await
            .unwrap();
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn malformed_arguments_are_invalid() {
        let tool = EchoTool { state_key: "echo" };
        let err = tool.execute("not json", &test_ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn definition_serializes_to_function_format() {
        let tool = EchoTool { state_key: "echo" };
        let json = serde_json::to_value(tool.definition()).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "test-echo");
        assert!(json["function"]["parameters"].is_object());
    }

    #[test]
    fn registry_resolves_and_lists() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { state_key: "echo" }));

        assert!(registry.contains("test-echo"));
        assert!(registry.get("test-echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn tool_states_deduplicate_by_key() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool { state_key: "shared" }));

        struct OtherEcho;

        #[async_trait]
        impl Tool for OtherEcho {
            fn name(&self) -> &str {
                "test-other"
            }
            fn description(&self) -> String {
                "Other.".to_owned()
            }
            fn parameters_schema(&self) -> String {
                "{}".to_owned()
            }
            async fn execute(
                &self,
                _arguments: &str,
                _ctx: &ToolContext,
            ) -> Result<ToolExecuteResult, ToolError> {
                Ok(ToolExecuteResult::new(""))
            }
            fn current_state(&self) -> Option<ToolState> {
                Some(ToolState::new("shared", "other view"))
            }
        }

        registry.register(Arc::new(OtherEcho));
        assert_eq!(registry.tool_states().len(), 1);
    }
}
