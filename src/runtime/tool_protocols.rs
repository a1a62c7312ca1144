//! Concrete [`ToolProvider`] adapters.
//!
//! - [`CustomToolProvider`]: direct Rust function registration (sync and async), the same
//!   quick-prototyping path for wiring a handful of ad hoc tools without a full provider.
//! - [`CalculatorToolProvider`]: wraps the bundled [`Calculator`] as a single-tool provider, the
//!   canonical "first tool" a reader reaches for when wiring up a registry.
//!
//! # Example
//!
//! ```rust,no_run
//! use turnflow::tool_protocol::{ToolDefinition, ToolRegistry};
//! use turnflow::tool_protocols::CustomToolProvider;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let adapter = CustomToolProvider::new();
//! adapter
//!     .register_tool(
//!         ToolDefinition::new(
//!             "add",
//!             "Adds two numbers",
//!             serde_json::json!({
//!                 "type": "object",
//!                 "required": ["a", "b"],
//!                 "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
//!             }),
//!         ),
//!         Arc::new(|args| {
//!             let a = args["a"].as_f64().unwrap_or(0.0);
//!             let b = args["b"].as_f64().unwrap_or(0.0);
//!             Ok(serde_json::json!({"sum": a + b}))
//!         }),
//!     )
//!     .await;
//! let mut registry = ToolRegistry::new();
//! registry.add_provider(Arc::new(adapter));
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::runtime::dispatcher::ExecContext;
use crate::runtime::event::{Event, EventKind};
use crate::runtime::tool_protocol::{ToolCall, ToolDefinition, ToolEventStream, ToolProvider};
use crate::runtime::tools::Calculator;

/// Synchronous tool function: arguments in, a JSON result or an error message out.
pub type ToolFunction = Arc<dyn Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Asynchronous tool function, for handlers that need to await I/O.
pub type AsyncToolFunction =
    Arc<dyn Fn(JsonValue) -> Pin<Box<dyn Future<Output = Result<JsonValue, String>> + Send>> + Send + Sync>;

/// Registers plain Rust closures as tools.
#[derive(Clone, Default)]
pub struct CustomToolProvider {
    tools: Arc<RwLock<HashMap<String, ToolDefinition>>>,
    sync_functions: Arc<RwLock<HashMap<String, ToolFunction>>>,
    async_functions: Arc<RwLock<HashMap<String, AsyncToolFunction>>>,
}

impl CustomToolProvider {
    pub fn new() -> Self {
        CustomToolProvider::default()
    }

    pub async fn register_tool(&self, definition: ToolDefinition, function: ToolFunction) {
        let id = definition.id.clone();
        self.tools.write().await.insert(id.clone(), definition);
        self.sync_functions.write().await.insert(id, function);
    }

    pub async fn register_async_tool(&self, definition: ToolDefinition, function: AsyncToolFunction) {
        let id = definition.id.clone();
        self.tools.write().await.insert(id.clone(), definition);
        self.async_functions.write().await.insert(id, function);
    }
}

#[async_trait]
impl ToolProvider for CustomToolProvider {
    fn name(&self) -> &str {
        "custom"
    }

    async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
        self.tools.read().await.get(id).cloned()
    }

    async fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().await.values().cloned().collect()
    }

    fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
        let sync_functions = self.sync_functions.clone();
        let async_functions = self.async_functions.clone();
        Box::pin(stream::once(async move {
            let outcome = {
                let sync_guard = sync_functions.read().await;
                if let Some(function) = sync_guard.get(&call.name) {
                    function(call.arguments.clone())
                } else {
                    drop(sync_guard);
                    let async_guard = async_functions.read().await;
                    match async_guard.get(&call.name) {
                        Some(function) => function(call.arguments.clone()).await,
                        None => Err(format!("no function registered for tool '{}'", call.name)),
                    }
                }
            };
            complete_event(ctx, call, outcome)
        }))
    }
}

/// Wraps the bundled [`Calculator`] as a single-tool provider.
#[derive(Clone)]
pub struct CalculatorToolProvider {
    calculator: Calculator,
    definition: ToolDefinition,
}

impl CalculatorToolProvider {
    pub fn new(calculator: Calculator) -> Self {
        let definition = ToolDefinition::new(
            "calculator",
            "Evaluates a mathematical expression, including arithmetic, trigonometry, and basic statistics.",
            serde_json::json!({
                "type": "object",
                "required": ["expression"],
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "The expression to evaluate, e.g. \"sqrt(16) + mean([1,2,3])\""
                    }
                }
            }),
        )
        .with_icon("calculator");
        CalculatorToolProvider { calculator, definition }
    }
}

#[async_trait]
impl ToolProvider for CalculatorToolProvider {
    fn name(&self) -> &str {
        "calculator"
    }

    async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
        (id == self.definition.id).then(|| self.definition.clone())
    }

    async fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![self.definition.clone()]
    }

    fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
        let calculator = self.calculator.clone();
        Box::pin(stream::once(async move {
            let expression = call
                .arguments
                .get("expression")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let outcome = calculator
                .evaluate(&expression)
                .await
                .map(|value| serde_json::json!(value))
                .map_err(|err| err.to_string());
            complete_event(ctx, call, outcome)
        }))
    }
}

fn complete_event(ctx: ExecContext, call: ToolCall, outcome: Result<JsonValue, String>) -> Event {
    let kind = match outcome {
        Ok(result) => EventKind::ToolComplete {
            tool_call_id: call.id,
            tool_name: call.name,
            success: true,
            result: Some(result),
            error: None,
        },
        Err(error) => EventKind::ToolComplete {
            tool_call_id: call.id,
            tool_name: call.name,
            success: false,
            result: None,
            error: Some(error),
        },
    };
    Event::new(ctx.context_id, ctx.task_id, kind).with_path(ctx.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn ctx() -> ExecContext {
        ExecContext {
            context_id: "ctx-1".to_string(),
            task_id: "task-1".to_string(),
            path: Vec::new(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn custom_provider_executes_registered_sync_function() {
        let adapter = CustomToolProvider::new();
        adapter
            .register_tool(
                ToolDefinition::new(
                    "add",
                    "adds",
                    serde_json::json!({"type": "object", "required": ["a", "b"], "properties": {}}),
                ),
                Arc::new(|args| {
                    let a = args["a"].as_f64().unwrap_or(0.0);
                    let b = args["b"].as_f64().unwrap_or(0.0);
                    Ok(serde_json::json!(a + b))
                }),
            )
            .await;

        let call = ToolCall {
            id: "c1".to_string(),
            name: "add".to_string(),
            arguments: serde_json::json!({"a": 2, "b": 3}),
        };
        let mut events = adapter.execute_tool(call, ctx());
        let event = events.next().await.unwrap();
        match event.kind {
            EventKind::ToolComplete { success, result, .. } => {
                assert!(success);
                assert_eq!(result, Some(serde_json::json!(5.0)));
            }
            _ => panic!("expected tool-complete"),
        }
    }

    #[tokio::test]
    async fn calculator_provider_evaluates_expression() {
        let provider = CalculatorToolProvider::new(Calculator::new());
        let call = ToolCall {
            id: "c1".to_string(),
            name: "calculator".to_string(),
            arguments: serde_json::json!({"expression": "2 + 2"}),
        };
        let mut events = provider.execute_tool(call, ctx());
        let event = events.next().await.unwrap();
        match event.kind {
            EventKind::ToolComplete { success, result, .. } => {
                assert!(success);
                assert_eq!(result, Some(serde_json::json!(4.0)));
            }
            _ => panic!("expected tool-complete"),
        }
    }

    #[tokio::test]
    async fn calculator_provider_surfaces_errors_as_failure() {
        let provider = CalculatorToolProvider::new(Calculator::new());
        let call = ToolCall {
            id: "c1".to_string(),
            name: "calculator".to_string(),
            arguments: serde_json::json!({"expression": "1 / 0"}),
        };
        let mut events = provider.execute_tool(call, ctx());
        let event = events.next().await.unwrap();
        assert!(matches!(event.kind, EventKind::ToolComplete { success: false, .. }));
    }
}
