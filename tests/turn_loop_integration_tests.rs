//! End-to-end turn loop tests: a scripted provider, the real calculator tool (not a mock), the
//! dispatcher, and the ring buffer, wired together the way a host would wire them.

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;
use std::error::Error;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

use turnflow::client_wrapper::{self, MessageChunk, MessageChunkStream, MessageStreamFuture, Role, TokenUsage};
use turnflow::event::{EventKind, FinishReason};
use turnflow::ring_buffer::EventRingBuffer;
use turnflow::tool_protocol::ToolRegistry;
use turnflow::tool_protocols::CalculatorToolProvider;
use turnflow::tools::Calculator;
use turnflow::{CancellationToken, ClientWrapper, Dispatcher, LoopContext, Message, TurnLoop};
use turnflow::config::RuntimeConfig;

type ChunkSpec = (String, Vec<(String, String, String)>, Option<String>);

/// A provider stub that plays back a scripted sequence of streamed responses, one per call to
/// `send_message_stream`, mirroring how a real provider streams a tool call on one turn and a
/// final answer on the next.
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
        unreachable!("this test only exercises the streaming path")
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
        "scripted"
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

/// A full turn that calls the real calculator through the dispatcher, replays every emitted
/// event through the ring buffer, and asserts both the final answer and the replay contents.
#[tokio::test]
async fn turn_with_real_calculator_tool_completes_and_replays() {
    let client = ScriptedClient::new(vec![
        vec![(
            "".to_string(),
            vec![("c1".to_string(), "calculator".to_string(), "{\"expression\":\"6 * 7\"}".to_string())],
            Some("tool_calls".to_string()),
        )],
        vec![("The answer is 42".to_string(), vec![], Some("stop".to_string()))],
    ]);

    let mut registry = ToolRegistry::new();
    let calculator_provider = std::sync::Arc::new(CalculatorToolProvider::new(Calculator::new()));
    registry.add_provider(calculator_provider.clone());
    let dispatcher = Dispatcher::new(registry);
    let cfg = RuntimeConfig::default();
    let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
    let loop_ctx = LoopContext::new("agent-1", "ctx-1", "task-1").with_tool_provider(calculator_provider);

    let outcome = turn_loop.run(&loop_ctx, &[], &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.content, "The answer is 42");
    assert_eq!(outcome.finish_reason, FinishReason::Stop);

    let tool_complete = outcome
        .events
        .iter()
        .find(|e| matches!(e.kind, EventKind::ToolComplete { .. }))
        .expect("tool complete event present");
    match &tool_complete.kind {
        EventKind::ToolComplete { success, result, .. } => {
            assert!(success);
            assert_eq!(*result, Some(json!(42.0)));
        }
        _ => unreachable!(),
    }

    let ring_buffer = EventRingBuffer::new(64);
    for event in outcome.events {
        ring_buffer.append(&loop_ctx.context_id, event);
    }
    let replay = ring_buffer.replay(&loop_ctx.context_id, 0);
    assert!(!replay.gap);
    assert!(replay.events.iter().any(|e| matches!(e.event.kind, EventKind::TaskCreated)));
    assert!(replay
        .events
        .iter()
        .any(|e| matches!(e.event.kind, EventKind::TaskComplete { .. })));
}

/// A failing calculator expression should surface as a failed tool-complete but still let the
/// turn proceed to a final answer rather than aborting the whole turn.
#[tokio::test]
async fn turn_recovers_from_tool_failure_and_still_completes() {
    let client = ScriptedClient::new(vec![
        vec![(
            "".to_string(),
            vec![("c1".to_string(), "calculator".to_string(), "{\"expression\":\"1 / 0\"}".to_string())],
            Some("tool_calls".to_string()),
        )],
        vec![("Division by zero is undefined".to_string(), vec![], Some("stop".to_string()))],
    ]);

    let mut registry = ToolRegistry::new();
    let calculator_provider = std::sync::Arc::new(CalculatorToolProvider::new(Calculator::new()));
    registry.add_provider(calculator_provider.clone());
    let dispatcher = Dispatcher::new(registry);
    let cfg = RuntimeConfig::default();
    let turn_loop = TurnLoop::new(&client, &dispatcher, &cfg);
    let loop_ctx = LoopContext::new("agent-1", "ctx-2", "task-2").with_tool_provider(calculator_provider);

    let outcome = turn_loop.run(&loop_ctx, &[], &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.content, "Division by zero is undefined");
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e.kind, EventKind::ToolComplete { success: false, .. })));
}
