//! Turn loop (C7).
//!
//! The outer state machine (§4.6): `Init` emits `task-created` then `task-status(working)`,
//! `Iterating(n)` drives one [`IterationExecutor`](crate::runtime::iteration::IterationExecutor)
//! call and decides whether another iteration is warranted, `Finalising` emits `task-complete`,
//! and `Done` is terminal. [`TurnLoop::run`] flattens the recursive "expand" pattern the source
//! describes into a driver-style loop that awaits each iteration before deciding to continue
//! (§9: "the recursive iteration loop with expand-and-merge").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::runtime::client_wrapper::{ClientWrapper, Message};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::errors::CoreError;
use crate::runtime::event::{Event, EventHandler, EventKind, FinishReason, TaskStatus};
use crate::runtime::history::events_to_messages;
use crate::runtime::iteration::IterationExecutor;
use crate::runtime::loop_context::LoopContext;

/// A cooperative cancellation signal shared between the host and an in-flight [`TurnLoop::run`].
///
/// Cloning shares the same underlying flag — every clone observes the same cancellation.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// Request cancellation. Idempotent; wakes any task currently awaiting
    /// [`CancellationToken::cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancellationToken::cancel`] has been called. Safe to await repeatedly or
    /// from multiple tasks (including after cancellation already happened, in which case it
    /// resolves immediately on the next poll via the `is_cancelled` fast path).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Everything observed over the whole turn: every event emitted across every iteration, the
/// final content, its finish reason, and the history a *subsequent* turn should start from
/// (initial history plus every iteration's assembled messages).
pub struct TurnOutcome {
    pub events: Vec<Event>,
    pub content: String,
    pub finish_reason: FinishReason,
    pub history: Vec<Message>,
}

/// Drives iterations until a terminal finish reason, the iteration cap, or cancellation.
pub struct TurnLoop<'a> {
    client: &'a dyn ClientWrapper,
    dispatcher: &'a Dispatcher,
    config: &'a RuntimeConfig,
    event_handler: Option<&'a dyn EventHandler>,
}

impl<'a> TurnLoop<'a> {
    pub fn new(client: &'a dyn ClientWrapper, dispatcher: &'a Dispatcher, config: &'a RuntimeConfig) -> Self {
        TurnLoop {
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

    /// Run a full turn starting from `initial_history`, honouring `cancellation` between (and
    /// during) iterations.
    ///
    /// Every terminal state the turn loop recovers from on its own — cancellation, the
    /// `stop_on_tool_error` policy, reaching `max_iterations` — still resolves to `Ok`; its event
    /// chain (`task-status`, `task-complete`, ...) already carries that outcome. `Err(CoreError)`
    /// is reserved for the one case the loop can't recover from in-band: the provider call itself
    /// failing (timeout, transport error, exhausted retries).
    pub async fn run(
        &self,
        loop_ctx: &LoopContext,
        initial_history: &[Message],
        cancellation: &CancellationToken,
    ) -> Result<TurnOutcome, CoreError> {
        let mut events = Vec::new();
        let mut history = initial_history.to_vec();

        events.push(self.emit(loop_ctx, EventKind::TaskCreated).await);
        events.push(
            self.emit(loop_ctx, EventKind::TaskStatus { status: TaskStatus::Working })
                .await,
        );

        let executor = {
            let mut executor = IterationExecutor::new(self.client, self.dispatcher, self.config);
            if let Some(handler) = self.event_handler {
                executor = executor.with_event_handler(handler);
            }
            executor
        };

        let mut last_content = String::new();
        let mut last_finish_reason = FinishReason::Stop;
        let mut iteration_number: u32 = 0;

        loop {
            if cancellation.is_cancelled() {
                return Ok(self.finalise_cancelled(loop_ctx, events, last_content).await);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Ok(self.finalise_cancelled(loop_ctx, events, last_content).await);
                }
                outcome = executor.run(loop_ctx, iteration_number, &history, cancellation) => outcome,
            };

            let iteration_outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::error!("turn {} aborted: provider iteration failed: {err}", loop_ctx.task_id);
                    self.finalise_failed(loop_ctx, events).await;
                    return Err(CoreError::Turn(err));
                }
            };

            let had_tool_failure = iteration_outcome
                .events
                .iter()
                .any(|e| matches!(e.kind, EventKind::ToolComplete { success: false, .. }));

            history.extend(events_to_messages(&iteration_outcome.events));
            events.extend(iteration_outcome.events);
            last_content = iteration_outcome.content;
            last_finish_reason = iteration_outcome.finish_reason;

            if self.config.stop_on_tool_error && had_tool_failure {
                break;
            }

            let more_iterations_allowed = iteration_number + 1 < self.config.max_iterations;
            if last_finish_reason == FinishReason::ToolCalls && more_iterations_allowed {
                iteration_number += 1;
                continue;
            }

            break;
        }

        let complete_event = self
            .emit(
                loop_ctx,
                EventKind::TaskComplete {
                    content: last_content.clone(),
                    finish_reason: last_finish_reason,
                },
            )
            .await;
        events.push(complete_event);

        Ok(TurnOutcome {
            events,
            content: last_content,
            finish_reason: last_finish_reason,
            history,
        })
    }

    async fn finalise_cancelled(&self, loop_ctx: &LoopContext, mut events: Vec<Event>, content: String) -> TurnOutcome {
        events.push(
            self.emit(loop_ctx, EventKind::TaskStatus { status: TaskStatus::Canceled })
                .await,
        );
        let complete_event = self
            .emit(
                loop_ctx,
                EventKind::TaskComplete {
                    content: content.clone(),
                    finish_reason: FinishReason::Error,
                },
            )
            .await;
        events.push(complete_event);
        TurnOutcome {
            events,
            content,
            finish_reason: FinishReason::Error,
            history: Vec::new(),
        }
    }

    async fn finalise_failed(&self, loop_ctx: &LoopContext, mut events: Vec<Event>) -> TurnOutcome {
        events.push(
            self.emit(loop_ctx, EventKind::TaskStatus { status: TaskStatus::Failed })
                .await,
        );
        let complete_event = self
            .emit(
                loop_ctx,
                EventKind::TaskComplete {
                    content: String::new(),
                    finish_reason: FinishReason::Error,
                },
            )
            .await;
        events.push(complete_event);
        TurnOutcome {
            events,
            content: String::new(),
            finish_reason: FinishReason::Error,
            history: Vec::new(),
        }
    }

    async fn emit(&self, loop_ctx: &LoopContext, kind: EventKind) -> Event {
        let event = Event::new(loop_ctx.context_id.clone(), loop_ctx.task_id.clone(), kind)
            .with_path(loop_ctx.parent_trace_scope.clone());
        if let Some(handler) = self.event_handler {
            handler.on_event(&event).await;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::client_wrapper::{self, MessageChunk, MessageChunkStream, MessageStreamFuture, Role, TokenUsage};
    use crate::runtime::dispatcher::ExecContext;
    use crate::runtime::tool_protocol::{ToolCall, ToolDefinition, ToolEventStream, ToolProvider, ToolRegistry};
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::error::Error;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;
    use tokio::time::Duration;

    type ChunkSpec = (String, Vec<(String, String, String)>, Option<String>);

    struct ScriptedClient {
        calls: StdMutex<Vec<Vec<ChunkSpec>>>,
    }

    impl ScriptedClient {
        fn new(calls: Vec<Vec<ChunkSpec>>) -> Self {
            ScriptedClient { calls: StdMutex::new(calls.into_iter().rev().collect()) }
        }
    }

    fn build_chunks(spec: &[ChunkSpec]) -> Vec<Result<MessageChunk, Box<dyn Error>>> {
        spec.iter()
            .map(|(content, tool_calls, finish_reason)| {
                Ok(MessageChunk {
                    index: 0,
                    content: content.clone(),
                    tool_calls: tool_calls
                        .iter()
                        .enumerate()
                        .map(|(i, (id, name, args))| client_wrapper::ToolCallChunk {
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
    impl ClientWrapper for ScriptedClient {
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
            let next = self.calls.lock().unwrap().pop().unwrap_or_default();
            let stream: MessageChunkStream = Box::pin(stream::iter(build_chunks(&next)));
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
    async fn pure_text_turn_matches_s1() {
        let client = ScriptedClient::new(vec![vec![
            ("Hello".to_string(), vec![], None),
            (" world".to_string(), vec![], Some("stop".to_string())),
        ]]);
        let dispatcher = Dispatcher::new(ToolRegistry::new());
        let cfg = config();
        let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1");
        let history = vec![Message { role: Role::User, content: "Hi".into(), tool_calls: Vec::new(), name: None }];

        let outcome = turn_loop.run(&loop_ctx, &history, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.content, "Hello world");
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert!(matches!(outcome.events[0].kind, EventKind::TaskCreated));
        assert!(matches!(outcome.events[1].kind, EventKind::TaskStatus { status: TaskStatus::Working }));
        assert!(matches!(outcome.events.last().unwrap().kind, EventKind::TaskComplete { .. }));
    }

    #[tokio::test]
    async fn single_tool_call_then_answer_matches_s2() {
        let client = ScriptedClient::new(vec![
            vec![(
                "".to_string(),
                vec![("c1".to_string(), "calc".to_string(), "{\"x\":1,\"y\":2}".to_string())],
                Some("tool_calls".to_string()),
            )],
            vec![("The answer is 3".to_string(), vec![], Some("stop".to_string()))],
        ]);
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(CalcProvider));
        let dispatcher = Dispatcher::new(registry);
        let cfg = config();
        let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1").with_tool_provider(Arc::new(CalcProvider));

        let outcome = turn_loop.run(&loop_ctx, &[], &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.content, "The answer is 3");
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert!(outcome.events.iter().any(|e| matches!(e.kind, EventKind::ToolStart { .. })));
        assert!(outcome.events.iter().any(|e| matches!(e.kind, EventKind::ToolComplete { success: true, .. })));

        // The second iteration's history must contain the assistant tool-calls message followed
        // by the tool-role result message (§8 S2 round-trip assertion).
        let tool_call_pos = outcome
            .history
            .iter()
            .position(|m| matches!(m.role, Role::Assistant) && !m.tool_calls.is_empty())
            .expect("assistant tool-call message present");
        match &outcome.history[tool_call_pos + 1].role {
            Role::Tool { call_id } => assert_eq!(call_id, "c1"),
            _ => panic!("expected tool message to follow the assistant tool-call message"),
        }
        assert_eq!(&*outcome.history[tool_call_pos + 1].content, "3");
    }

    #[tokio::test]
    async fn max_iterations_cap_ends_loop_without_error() {
        let chunks = vec![(
            "".to_string(),
            vec![("c1".to_string(), "calc".to_string(), "{}".to_string())],
            Some("tool_calls".to_string()),
        )];
        let client = ScriptedClient::new(vec![chunks.clone(), chunks.clone(), chunks]);
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(CalcProvider));
        let dispatcher = Dispatcher::new(registry);
        let cfg = RuntimeConfig { max_iterations: 2, ..RuntimeConfig::default() };
        let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1").with_tool_provider(Arc::new(CalcProvider));

        let outcome = turn_loop.run(&loop_ctx, &[], &CancellationToken::new()).await.unwrap();

        // Capped at 2 iterations even though the provider keeps requesting tool calls; no error.
        assert_eq!(outcome.finish_reason, FinishReason::ToolCalls);
        let tool_completes = outcome
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ToolComplete { .. }))
            .count();
        assert_eq!(tool_completes, 2);
    }

    struct FailingToolProvider;

    #[async_trait]
    impl ToolProvider for FailingToolProvider {
        fn name(&self) -> &str {
            "lookup"
        }

        async fn get_tool(&self, id: &str) -> Option<ToolDefinition> {
            (id == "lookup").then(|| ToolDefinition::new("lookup", "looks things up", json!({"type": "object"})))
        }

        async fn list_tools(&self) -> Vec<ToolDefinition> {
            vec![self.get_tool("lookup").await.unwrap()]
        }

        fn execute_tool(&self, call: ToolCall, ctx: ExecContext) -> ToolEventStream {
            let event = Event::new(
                ctx.context_id,
                ctx.task_id,
                EventKind::ToolComplete {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    success: false,
                    result: None,
                    error: Some("DB down".to_string()),
                },
            );
            Box::pin(stream::once(async { event }))
        }
    }

    #[tokio::test]
    async fn stop_on_tool_error_ends_turn_after_failing_iteration() {
        let chunks = vec![(
            "".to_string(),
            vec![("c1".to_string(), "lookup".to_string(), "{}".to_string())],
            Some("tool_calls".to_string()),
        )];
        // A second scripted call would answer normally, proving the loop never reaches it.
        let client = ScriptedClient::new(vec![
            chunks,
            vec![("should not be reached".to_string(), vec![], Some("stop".to_string()))],
        ]);
        let mut registry = ToolRegistry::new();
        registry.add_provider(Arc::new(FailingToolProvider));
        let dispatcher = Dispatcher::new(registry);
        let cfg = RuntimeConfig { stop_on_tool_error: true, ..RuntimeConfig::default() };
        let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1").with_tool_provider(Arc::new(FailingToolProvider));

        let outcome = turn_loop.run(&loop_ctx, &[], &CancellationToken::new()).await.unwrap();

        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e.kind, EventKind::ToolComplete { success: false, .. })));
        assert!(matches!(outcome.events.last().unwrap().kind, EventKind::TaskComplete { .. }));
        assert_eq!(outcome.finish_reason, FinishReason::ToolCalls);
    }

    #[tokio::test]
    async fn cancellation_emits_canceled_status_and_error_completion() {
        let client = ScriptedClient::new(vec![vec![("Hello".to_string(), vec![], Some("stop".to_string()))]]);
        let dispatcher = Dispatcher::new(ToolRegistry::new());
        let cfg = config();
        let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
        let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1");
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let outcome = turn_loop.run(&loop_ctx, &[], &cancellation).await.unwrap();

        assert_eq!(outcome.finish_reason, FinishReason::Error);
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e.kind, EventKind::TaskStatus { status: TaskStatus::Canceled })));
    }

    #[tokio::test]
    async fn cancellation_token_wakes_pending_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation should wake the waiter promptly")
            .unwrap();
    }
}
