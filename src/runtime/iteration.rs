//! Iteration executor (C6).
//!
//! One LLM call plus whatever tool invocations it triggers, folded into a single
//! [`IterationOutcome`]. The turn loop (C7) drives repeated iterations, feeding each one's history
//! back in via [`crate::runtime::history::events_to_messages`].

use futures_util::future::join_all;

use crate::runtime::aggregator::{AggregatedRecord, ChoiceDelta};
use crate::runtime::client_wrapper::{self, ClientWrapper, Message};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::dispatcher::{Dispatcher, ExecContext};
use crate::runtime::errors::TurnError;
use crate::runtime::event::{Event, EventHandler, EventKind, FinishReason, LifecycleTransition};
use crate::runtime::history::prepare_messages;
use crate::runtime::loop_context::LoopContext;
use crate::runtime::pipeline::run_pipeline;
use crate::runtime::tool_protocol::{self, ToolCall};
use crate::runtime::turn_loop::CancellationToken;

/// Everything observed while running one iteration.
pub struct IterationOutcome {
    /// Every event emitted during this iteration, in emission order: `content-delta`/
    /// `thought-stream` fragments as they resolve, then the dispatched tool sequences, then the
    /// trailing `content-complete`.
    pub events: Vec<Event>,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

/// Runs one iteration against a provider and a tool registry.
pub struct IterationExecutor<'a> {
    pub client: &'a dyn ClientWrapper,
    pub dispatcher: &'a Dispatcher,
    pub config: &'a RuntimeConfig,
    pub event_handler: Option<&'a dyn EventHandler>,
}

impl<'a> IterationExecutor<'a> {
    pub fn new(client: &'a dyn ClientWrapper, dispatcher: &'a Dispatcher, config: &'a RuntimeConfig) -> Self {
        IterationExecutor {
            client,
            dispatcher,
            config,
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Run iteration `iteration_number` against `history` (already containing every message
    /// assembled by prior iterations).
    pub async fn run(
        &self,
        loop_ctx: &LoopContext,
        iteration_number: u32,
        history: &[Message],
        cancellation: &CancellationToken,
    ) -> Result<IterationOutcome, TurnError> {
        self.notify_lifecycle(LifecycleTransition::IterationStarted {
            task_id: loop_ctx.task_id.clone(),
            iteration: iteration_number,
        })
        .await;

        let messages = prepare_messages(loop_ctx, history);
        let tools = self.collect_tool_definitions(loop_ctx).await;

        let mut events = Vec::new();
        let record = self
            .call_provider(loop_ctx, &messages, tools, &mut events, cancellation)
            .await?;

        for tool_call in &record.tool_calls {
            self.notify_lifecycle(LifecycleTransition::ToolDispatched {
                task_id: loop_ctx.task_id.clone(),
                tool_name: tool_call.name.clone(),
            })
            .await;
        }

        if !record.tool_calls.is_empty() {
            let exec_ctx = ExecContext::from_loop_context(loop_ctx, Vec::new());
            let dispatched = join_all(
                record
                    .tool_calls
                    .iter()
                    .map(|call| self.dispatcher.dispatch(call.clone(), exec_ctx.clone())),
            )
            .await;
            for mut call_events in dispatched {
                for event in call_events.drain(..) {
                    self.notify_event(&event).await;
                    events.push(event);
                }
            }
        }

        let finish_reason = record.finish_reason.unwrap_or(FinishReason::Stop);
        let complete_event = Event::new(
            loop_ctx.context_id.clone(),
            loop_ctx.task_id.clone(),
            EventKind::ContentComplete {
                content: record.content.clone(),
                tool_calls: record.tool_calls.clone(),
                finish_reason,
            },
        )
        .with_path(loop_ctx.parent_trace_scope.clone());
        self.notify_event(&complete_event).await;
        events.push(complete_event);

        self.notify_lifecycle(LifecycleTransition::IterationCompleted {
            task_id: loop_ctx.task_id.clone(),
            iteration: iteration_number,
        })
        .await;

        Ok(IterationOutcome {
            events,
            content: record.content,
            tool_calls: record.tool_calls,
            finish_reason,
        })
    }

    async fn collect_tool_definitions(&self, loop_ctx: &LoopContext) -> Vec<client_wrapper::ToolDefinition> {
        let listings = join_all(loop_ctx.tool_providers.iter().map(|provider| provider.list_tools())).await;
        listings
            .into_iter()
            .flatten()
            .map(|def| to_wire_tool_definition(&def))
            .collect()
    }

    /// Stream the provider's response through C4, pushing `content-delta`/`thought-stream` events
    /// into `events` as fragments resolve, and returning the single aggregated record once the
    /// stream (or its non-streaming fallback) completes.
    async fn call_provider(
        &self,
        loop_ctx: &LoopContext,
        messages: &[Message],
        tools: Vec<client_wrapper::ToolDefinition>,
        events: &mut Vec<Event>,
        cancellation: &CancellationToken,
    ) -> Result<AggregatedRecord, TurnError> {
        let stream_result = tokio::time::timeout(
            self.config.provider_timeout,
            self.client.send_message_stream(messages, Some(tools.clone())),
        )
        .await
        .map_err(|_| TurnError::Provider("provider call timed out".to_string()))?
        .map_err(|err| TurnError::Provider(err.to_string()))?;

        match stream_result {
            Some(stream) => {
                let mut handles =
                    run_pipeline(stream, self.config.recognised_thought_tags.clone(), cancellation.clone());
                let mut content_closed = false;
                let mut tags_closed = false;
                while !content_closed || !tags_closed {
                    tokio::select! {
                        fragment = handles.content.recv(), if !content_closed => {
                            match fragment {
                                Some(fragment) => {
                                    let event = Event::new(
                                        loop_ctx.context_id.clone(),
                                        loop_ctx.task_id.clone(),
                                        EventKind::ContentDelta { delta: fragment.delta, index: fragment.index },
                                    )
                                    .with_path(loop_ctx.parent_trace_scope.clone());
                                    self.notify_event(&event).await;
                                    events.push(event);
                                }
                                None => content_closed = true,
                            }
                        }
                        thought = handles.tags.recv(), if !tags_closed => {
                            match thought {
                                Some(thought) => {
                                    let event = Event::new(
                                        loop_ctx.context_id.clone(),
                                        loop_ctx.task_id.clone(),
                                        EventKind::ThoughtStream {
                                            content: thought.content,
                                            thought_type: thought.thought_type,
                                            verbosity: thought.verbosity,
                                        },
                                    )
                                    .with_path(loop_ctx.parent_trace_scope.clone());
                                    self.notify_event(&event).await;
                                    events.push(event);
                                }
                                None => tags_closed = true,
                            }
                        }
                    }
                }
                handles
                    .aggregated
                    .await
                    .map_err(|_| TurnError::Invariant("pipeline dropped without an aggregated record".to_string()))?
                    .map_err(TurnError::from)
            }
            None => {
                let message = tokio::time::timeout(
                    self.config.provider_timeout,
                    self.client.send_message(messages, Some(tools)),
                )
                .await
                .map_err(|_| TurnError::Provider("provider call timed out".to_string()))?
                .map_err(|err| TurnError::Provider(err.to_string()))?;
                Ok(aggregate_non_streaming_message(message))
            }
        }
    }

    async fn notify_event(&self, event: &Event) {
        if let Some(handler) = self.event_handler {
            handler.on_event(event).await;
        }
    }

    async fn notify_lifecycle(&self, transition: LifecycleTransition) {
        if let Some(handler) = self.event_handler {
            handler.on_lifecycle(&transition).await;
        }
    }
}

fn to_wire_tool_definition(def: &tool_protocol::ToolDefinition) -> client_wrapper::ToolDefinition {
    client_wrapper::ToolDefinition {
        name: def.id.clone(),
        description: def.description.clone(),
        parameters_schema: def.parameters_schema.clone(),
    }
}

/// Build an [`AggregatedRecord`] from a provider's full (non-streaming) response, for providers
/// whose [`ClientWrapper::send_message_stream`] falls back to the default `Ok(None)`.
fn aggregate_non_streaming_message(message: Message) -> AggregatedRecord {
    use crate::runtime::aggregator::{DeltaAggregator, ToolCallDelta};

    let finish_reason = if message.tool_calls.is_empty() {
        Some(FinishReason::Stop)
    } else {
        Some(FinishReason::ToolCalls)
    };
    let mut aggregator = DeltaAggregator::new();
    aggregator.push(&ChoiceDelta {
        index: 0,
        content: (!message.content.is_empty()).then(|| message.content.to_string()),
        tool_calls: message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCallDelta {
                index: index as u64,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_fragment: Some(call.arguments.to_string()),
            })
            .collect(),
        finish_reason,
    });
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::client_wrapper::{MessageChunk, MessageChunkStream, MessageStreamFuture, Role, TokenUsage};
    use crate::runtime::tool_protocol::{ToolDefinition, ToolEventStream, ToolProvider};
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::error::Error;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct StubClient {
        chunks: Vec<(String, Vec<(String, String, String)>, Option<String>)>,
    }

    fn build_chunks(
        spec: &[(String, Vec<(String, String, String)>, Option<String>)],
    ) -> Vec<Result<MessageChunk, Box<dyn Error>>> {
        spec.iter()
            .map(|(content, tool_calls, finish_reason)| {
                Ok(MessageChunk {
                    index: 0,
                    content: content.clone(),
                    tool_calls: tool_calls
                        .iter()
                        .enumerate()
                        .map(|(i, (id, name, args))| crate::runtime::client_wrapper::ToolCallChunk {
                            index: i as u64,
                            id: (!id.is_empty()).then(|| id.clone()),
                            name: (!name.is_empty()).then(|| name.clone()),
                            arguments_fragment: (!args.is_empty()).then(|| args.clone()),
                        })
                        .collect(),
                    finish_reason: finish_reason.clone(),
                })
            })
            .collect()
    }

    #[async_trait]
    impl ClientWrapper for StubClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            unreachable!("test stub only exercises the streaming path")
        }

        fn send_message_stream<'b>(
            &'b self,
            _messages: &'b [Message],
            _tools: Option<Vec<client_wrapper::ToolDefinition>>,
        ) -> MessageStreamFuture<'b> {
            let stream: MessageChunkStream = Box::pin(stream::iter(build_chunks(&self.chunks)));
            Box::pin(async move { Ok(Some(stream)) })
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
            None
        }
    }

    struct CalcProvider;

    #[async_trait]
    impl ToolProvider for CalcProvider {
        fn name(&self) -> &str {
            "calc"
        }

        async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
            (id == "calc").then(|| ToolDefinition::new("calc", "adds numbers", json!({"type": "object"})))
        }

        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![self.get_tool("calc").await.unwrap()]
        }

        fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
            let event = Event::new(
                ctx.context_id,
                ctx.task_id,
                EventKind::ToolComplete {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    success: true,
                    result: Some(json!(3)),
                    error: None,
                },
            );
            Box::pin(stream::once(async { event }))
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[tokio::test]
    async fn pure_text_iteration_produces_deltas_then_content_complete() {
        let client = StubClient {
            chunks: vec![
                ("Hello".to_string(), vec![], None),
                (" world".to_string(), vec![], Some("stop".to_string())),
            ],
        };
        let dispatcher = Dispatcher::new(crate::runtime::tool_protocol::ToolRegistry::new());
        let cfg = config();
        let executor = IterationExecutor::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1");
        let history = vec![Message { role: Role::User, content: "Hi".into(), tool_calls: Vec::new(), name: None }];

        let outcome = executor
            .run(&loop_ctx, 0, &history, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, "Hello world");
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        // Two content-delta fragments followed by content-complete.
        assert_eq!(outcome.events.len(), 3);
        assert!(matches!(outcome.events[0].kind, EventKind::ContentDelta { .. }));
        assert!(matches!(outcome.events[1].kind, EventKind::ContentDelta { .. }));
        assert!(matches!(outcome.events[2].kind, EventKind::ContentComplete { .. }));
    }

    #[tokio::test]
    async fn tool_call_iteration_dispatches_and_appends_tool_complete() {
        let client = StubClient {
            chunks: vec![(
                "".to_string(),
                vec![("c1".to_string(), "calc".to_string(), "{}".to_string())],
                Some("tool_calls".to_string()),
            )],
        };
        let mut registry = crate::runtime::tool_protocol::ToolRegistry::new();
        registry.add_provider(Arc::new(CalcProvider));
        let dispatcher = Dispatcher::new(registry);
        let cfg = config();
        let executor = IterationExecutor::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1").with_tool_provider(Arc::new(CalcProvider));

        let outcome = executor
            .run(&loop_ctx, 0, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::ToolCalls);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.events.len(), 2);
        assert!(matches!(outcome.events[0].kind, EventKind::ToolComplete { success: true, .. }));
        assert!(matches!(outcome.events[1].kind, EventKind::ContentComplete { .. }));
    }
}
