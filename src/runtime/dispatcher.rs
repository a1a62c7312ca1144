//! Tool dispatcher (C5).
//!
//! Resolves a tool name against the registered [`ToolProvider`](crate::runtime::tool_protocol::ToolProvider)s,
//! wraps the winning provider's event sequence with the `tool-start` / `tool-complete` lifecycle,
//! and normalises failures into `tool-complete{success:false}` rather than ever propagating an
//! error out of the turn loop. Wraps each provider's lazy event sequence with the tool-start/tool-complete
//! lifecycle described below.

use futures_util::StreamExt;

use crate::runtime::errors::DispatchError;
use crate::runtime::event::{Event, EventKind};
use crate::runtime::loop_context::{AuthContext, LoopContext};
use crate::runtime::tool_protocol::{ToolCall, ToolRegistry};

/// Per-call execution context, derived from [`LoopContext`] plus the parent trace scope of the
/// current iteration (§4.4: "execContext derives from LoopContext and additionally carries the
/// parent trace scope of the current iteration").
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub context_id: String,
    pub task_id: String,
    pub path: Vec<String>,
    pub auth: Option<AuthContext>,
}

impl ExecContext {
    pub fn from_loop_context(loop_ctx: &LoopContext, iteration_trace_scope: Vec<String>) -> Self {
        let mut path = loop_ctx.parent_trace_scope.clone();
        path.extend(iteration_trace_scope);
        ExecContext {
            context_id: loop_ctx.context_id.clone(),
            task_id: loop_ctx.task_id.clone(),
            path,
            auth: loop_ctx.auth.clone(),
        }
    }
}

/// Resolves tool calls against a [`ToolRegistry`] and wraps execution in lifecycle events.
pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Dispatcher { registry }
    }

    /// Dispatch one tool call. Returns the full event sequence for this call: `tool-start`,
    /// whatever the provider streamed, and a trailing `tool-complete` (passed through from the
    /// provider or synthesised here). An empty vec means no provider resolved the tool — the
    /// `tool-call` event the caller already holds is passed through untouched (§4.4).
    pub async fn dispatch(&self, call: ToolCall, exec_ctx: ExecContext) -> Vec<Event> {
        let Some((provider, definition)) = self.registry.resolve(&call.name).await else {
            log::warn!("{}", DispatchError::ToolNotFound(call.name.clone()));
            return Vec::new();
        };

        let mut events = Vec::new();
        events.push(
            Event::new(
                exec_ctx.context_id.clone(),
                exec_ctx.task_id.clone(),
                EventKind::ToolStart {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    icon: definition.icon.clone(),
                },
            )
            .with_path(exec_ctx.path.clone()),
        );

        if let Err(validation_error) = validate_arguments(&definition, &call.arguments) {
            log::warn!("tool '{}' argument validation failed: {validation_error}", call.name);
            events.push(self.synth_failure(&call, &exec_ctx, DispatchError::InvalidArguments(validation_error)));
            return events;
        }

        let mut provider_stream = provider.execute_tool(call.clone(), exec_ctx.clone());
        let mut saw_completion = false;
        while let Some(mut event) = provider_stream.next().await {
            if !exec_ctx.path.is_empty() {
                event = event.with_path(prefix_path(&exec_ctx.path, &event.path));
            }
            if matches!(event.kind, EventKind::ToolComplete { .. }) {
                saw_completion = true;
            }
            events.push(event);
        }

        if !saw_completion {
            // §4.4 point 4: a provider sequence that ends without its own tool-complete is an
            // asynchronous failure, not a quiet success — synthesise a failed completion rather
            // than guessing the call succeeded.
            let error = DispatchError::ExecutionFailed(format!(
                "provider '{}' ended its event sequence without emitting tool-complete",
                provider.name()
            ));
            log::warn!("{error}");
            events.push(self.synth_failure(&call, &exec_ctx, error));
        }

        events
    }

    fn synth_failure(&self, call: &ToolCall, exec_ctx: &ExecContext, error: DispatchError) -> Event {
        Event::new(
            exec_ctx.context_id.clone(),
            exec_ctx.task_id.clone(),
            EventKind::ToolComplete {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: false,
                result: None,
                error: Some(error.to_string()),
            },
        )
        .with_path(exec_ctx.path.clone())
    }
}

/// Minimal structural validator: every key listed under `parameters_schema.required` must be
/// present in the call's arguments object.
fn validate_arguments(definition: &crate::runtime::tool_protocol::ToolDefinition, arguments: &serde_json::Value) -> Result<(), String> {
    let required = definition.required_properties();
    if required.is_empty() {
        return Ok(());
    }
    let object = arguments.as_object();
    for key in &required {
        let present = object.map(|o| o.contains_key(key)).unwrap_or(false);
        if !present {
            return Err(format!("missing required argument '{key}'"));
        }
    }
    Ok(())
}

/// Agent-as-tool propagation (§4.4): prepend the dispatcher's own path onto whatever path a child
/// agent's event already carries, without duplicating segments already present.
fn prefix_path(prefix: &[String], existing: &[String]) -> Vec<String> {
    let mut combined = prefix.to_vec();
    combined.extend(existing.iter().cloned());
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tool_protocol::{ToolDefinition, ToolEventStream, ToolProvider};
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::Arc;

    struct EchoProvider;

    #[async_trait]
    impl ToolProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
            (id == "echo").then(|| {
                ToolDefinition::new(
                    "echo",
                    "echoes input",
                    json!({"type": "object", "required": ["text"], "properties": {"text": {"type": "string"}}}),
                )
            })
        }

        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![self.get_tool("echo").await.unwrap()]
        }

        fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
            let event = Event::new(
                ctx.context_id,
                ctx.task_id,
                EventKind::ToolComplete {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    success: true,
                    result: Some(call.arguments.get("text").cloned().unwrap_or(serde_json::Value::Null)),
                    error: None,
                },
            );
            Box::pin(stream::once(async { event }))
        }
    }

    fn ctx() -> ExecContext {
        ExecContext {
            context_id: "ctx-1".to_string(),
            task_id: "task-1".to_string(),
            path: Vec::new(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn missing_provider_returns_empty() {
        let dispatcher = Dispatcher::new(ToolRegistry::new());
        let call = ToolCall {
            id: "c1".to_string(),
            name: "nope".to_string(),
            arguments: json!({}),
        };
        let events = dispatcher.dispatch(call, ctx()).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn successful_dispatch_emits_start_then_complete() {
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(EchoProvider));
        let dispatcher = Dispatcher::new(registry);
        let call = ToolCall {
            id: "c1".to_string(),
            name: "echo".to_string(),
            arguments: json!({"text": "hi"}),
        };
        let events = dispatcher.dispatch(call, ctx()).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, EventKind::ToolStart { .. }));
        assert!(matches!(events[1].kind, EventKind::ToolComplete { success: true, .. }));
    }

    /// Agent-as-tool (§4.4/§4.3 S6): a child agent's events arrive already tagged
    /// `parent_task_id` and with their own `path`; the dispatcher must prepend its own path
    /// (here standing in for the `agent:<childName>` segment the caller adds) without disturbing
    /// the `parent_task_id` that keeps these events out of the parent's history assembly (C8).
    struct ChildAgentProvider;

    #[async_trait]
    impl ToolProvider for ChildAgentProvider {
        fn name(&self) -> &str {
            "agent-b"
        }

        async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
            (id == "agent-b").then(|| ToolDefinition::new("agent-b", "invokes agent B", json!({"type": "object"})))
        }

        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![self.get_tool("agent-b").await.unwrap()]
        }

        fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
            let content_complete = Event::new(
                ctx.context_id.clone(),
                "child-task-1",
                EventKind::ContentComplete {
                    content: "sub".to_string(),
                    tool_calls: vec![],
                    finish_reason: crate::runtime::event::FinishReason::Stop,
                },
            )
            .with_parent_task_id(ctx.task_id.clone());
            let complete = Event::new(
                ctx.context_id,
                ctx.task_id,
                EventKind::ToolComplete {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    success: true,
                    result: Some(json!("sub")),
                    error: None,
                },
            );
            Box::pin(stream::iter(vec![content_complete, complete]))
        }
    }

    #[tokio::test]
    async fn agent_as_tool_events_keep_parent_task_id_and_gain_path_prefix() {
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(ChildAgentProvider));
        let dispatcher = Dispatcher::new(registry);
        let call = ToolCall {
            id: "c1".to_string(),
            name: "agent-b".to_string(),
            arguments: json!({}),
        };
        let mut exec_ctx = ctx();
        exec_ctx.path = vec!["agent:B".to_string()];

        let events = dispatcher.dispatch(call, exec_ctx).await;
        // tool-start, the child's content-complete, the child's own tool-complete.
        assert_eq!(events.len(), 3);
        let child_content = &events[1];
        assert_eq!(child_content.path, vec!["agent:B".to_string()]);
        assert_eq!(child_content.parent_task_id.as_deref(), Some("task-1"));
        assert!(matches!(child_content.kind, EventKind::ContentComplete { .. }));

        let tool_complete = &events[2];
        match &tool_complete.kind {
            EventKind::ToolComplete { success, result, .. } => {
                assert!(success);
                assert_eq!(result, &Some(json!("sub")));
            }
            _ => panic!("expected tool-complete"),
        }
    }

    struct SilentProvider;

    #[async_trait]
    impl ToolProvider for SilentProvider {
        fn name(&self) -> &str {
            "silent"
        }

        async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
            (id == "silent").then(|| ToolDefinition::new("silent", "never completes", json!({"type": "object"})))
        }

        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![self.get_tool("silent").await.unwrap()]
        }

        fn execute_tool(&self, _call: ToolCall, _ctx: ExecContext) -> ToolEventStream {
            // Emits nothing at all before its stream ends — no tool-complete, no error.
            Box::pin(stream::empty())
        }
    }

    #[tokio::test]
    async fn stream_ending_without_tool_complete_is_treated_as_failure() {
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(SilentProvider));
        let dispatcher = Dispatcher::new(registry);
        let call = ToolCall {
            id: "c1".to_string(),
            name: "silent".to_string(),
            arguments: json!({}),
        };
        let events = dispatcher.dispatch(call, ctx()).await;
        assert_eq!(events.len(), 2);
        match &events[1].kind {
            EventKind::ToolComplete { success, error, .. } => {
                assert!(!success);
                assert!(error.is_some());
            }
            _ => panic!("expected tool-complete"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_synthesises_failure_without_calling_provider() {
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(EchoProvider));
        let dispatcher = Dispatcher::new(registry);
        let call = ToolCall {
            id: "c1".to_string(),
            name: "echo".to_string(),
            arguments: json!({}),
        };
        let events = dispatcher.dispatch(call, ctx()).await;
        assert_eq!(events.len(), 2);
        match &events[1].kind {
            EventKind::ToolComplete { success, error, .. } => {
                assert!(!success);
                assert!(error.as_ref().unwrap().contains("text"));
            }
            _ => panic!("expected tool-complete"),
        }
    }
}
