//! Tool provider abstraction (§6 "Tool provider").
//!
//! A tool provider exposes `{name, getTool(id), listTools(), executeTool(toolCall, execContext)}`.
//! [`ToolRegistry`] aggregates an ordered list of providers and performs resolution directly: first
//! provider whose `get_tool` answers wins, `list_tools` results are concatenated without
//! de-duplication.
//!
//! # Example
//!
//! ```rust,no_run
//! use turnflow::tool_protocol::ToolRegistry;
//! use turnflow::tool_protocols::CalculatorToolProvider;
//! use turnflow::tools::Calculator;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut registry = ToolRegistry::new();
//! registry.add_provider(Arc::new(CalculatorToolProvider::new(Calculator::new())));
//! let tools = registry.list_tools().await;
//! assert!(!tools.is_empty());
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::dispatcher::ExecContext;
use crate::runtime::event::Event;

/// Unique id (alphanumeric, underscore, hyphen; length 1..64), description, optional icon, and an
/// object-typed JSON Schema for parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// An object-typed JSON Schema: `{"type": "object", "properties": {...}, "required": [...]}`.
    pub parameters_schema: Value,
}

impl ToolDefinition {
    pub fn new(id: impl Into<String>, description: impl Into<String>, parameters_schema: Value) -> Self {
        ToolDefinition {
            id: id.into(),
            description: description.into(),
            icon: None,
            parameters_schema,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Valid id: 1-64 characters, alphanumeric/underscore/hyphen only.
    pub fn has_valid_id(&self) -> bool {
        let len = self.id.len();
        (1..=64).contains(&len)
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    /// Required property names declared under `parameters_schema.required`, used by the
    /// dispatcher's structural argument validator.
    pub fn required_properties(&self) -> Vec<String> {
        self.parameters_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A single tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The outcome of one tool invocation.
///
/// Distinct from the `tool-complete` *event* — this is the provider-facing return value that the
/// dispatcher (C5) turns into that event; it additionally carries optional messages a provider
/// wants injected into history beyond the usual tool-role message (e.g. a provider that wants to
/// also surface a system note).
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub additional_messages: Vec<crate::runtime::client_wrapper::Message>,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, tool_name: impl Into<String>, result: Value) -> Self {
        ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: true,
            result: Some(result),
            error: None,
            additional_messages: Vec::new(),
        }
    }

    pub fn failure(tool_call_id: impl Into<String>, tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            additional_messages: Vec::new(),
        }
    }

    pub fn with_additional_messages(mut self, messages: Vec<crate::runtime::client_wrapper::Message>) -> Self {
        self.additional_messages = messages;
        self
    }
}

/// A lazy sequence of events a tool execution produces. Most tools yield nothing but a final
/// `tool-complete`; long-running ones may emit `tool-progress` first.
pub type ToolEventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// A backend capable of describing and executing a set of tools.
///
/// `execute_tool` returns a lazy event sequence rather than a single [`ToolResult`] so that
/// long-running tools can stream `tool-progress` before their final `tool-complete` — the
/// dispatcher (C5) is the layer that synthesises a `tool-complete` if the provider's own sequence
/// didn't supply one.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider name, used only for logging/diagnostics — not part of tool resolution, which goes
    /// through `get_tool`/`list_tools` directly.
    fn name(&self) -> &str;

    async fn get_tool(&self, id: &str) -> Option<ToolDefinition>;

    async fn list_tools(&self) -> Vec<ToolDefinition>;

    fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream;
}

/// Aggregates an ordered list of [`ToolProvider`]s and performs the §4.4 resolution: first
/// provider whose `get_tool` answers wins; a plain ordered `Vec` since resolution order — not a
/// keyed map — is what's load bearing here.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { providers: Vec::new() }
    }

    pub fn from_providers(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        ToolRegistry { providers }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn ToolProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn ToolProvider>] {
        &self.providers
    }

    /// Resolution per §4.4: ask each provider in order, return the first hit and the provider that
    /// produced it.
    pub async fn resolve(&self, name: &str) -> Option<(Arc<dyn ToolProvider>, ToolDefinition)> {
        for provider in &self.providers {
            if let Some(definition) = provider.get_tool(name).await {
                return Some((provider.clone(), definition));
            }
        }
        None
    }

    /// Concatenation of every provider's `list_tools()`, in provider registration order.
    /// Duplicate ids are **not** de-duplicated here (§4.5 step 2) — resolution order at dispatch
    /// time is what actually picks a winner.
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut all = Vec::new();
        for provider in &self.providers {
            all.extend(provider.list_tools().await);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definition_id_validation() {
        let valid = ToolDefinition::new("calc_v2", "d", Value::Null);
        assert!(valid.has_valid_id());
        let invalid = ToolDefinition::new("has a space", "d", Value::Null);
        assert!(!invalid.has_valid_id());
        let empty = ToolDefinition::new("", "d", Value::Null);
        assert!(!empty.has_valid_id());
    }

    #[test]
    fn required_properties_reads_schema() {
        let def = ToolDefinition::new(
            "calc",
            "d",
            serde_json::json!({"type": "object", "required": ["x", "y"], "properties": {}}),
        );
        assert_eq!(def.required_properties(), vec!["x".to_string(), "y".to_string()]);
    }
}
