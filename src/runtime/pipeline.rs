//! Streaming pipeline (C4).
//!
//! Fans one provider delta stream into four derived streams — content, tags, tool calls,
//! aggregated — while subscribing to the upstream exactly once. `run_pipeline` takes ownership of
//! the stream the provider returned and spawns a single task that reads it to completion, fanning
//! each chunk out to plain `tokio::sync::mpsc` channels. Because only one task ever calls
//! `.next()` on the upstream, a naive multi-subscription fan-out is structurally impossible here.

use std::collections::HashSet;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::runtime::aggregator::{AggregatedRecord, ChoiceDelta, DeltaAggregator, ToolCallDelta};
use crate::runtime::client_wrapper::{MessageChunk, MessageChunkStream};
use crate::runtime::errors::PipelineError;
use crate::runtime::event::{FinishReason, Verbosity};
use crate::runtime::tag_parser::{ParserEvent, TagParser};
use crate::runtime::tool_protocol::ToolCall;
use crate::runtime::turn_loop::CancellationToken;

/// One `content-delta` candidate: an incremental, tag-free text fragment plus the index the
/// pipeline assigned it. Indices are strictly monotonic per task (§8 invariant 2).
#[derive(Debug, Clone)]
pub struct ContentFragment {
    pub index: u64,
    pub delta: String,
}

/// One `thought-stream` candidate, already filtered against the recognised-tag set (§4.3).
#[derive(Debug, Clone)]
pub struct ThoughtFragment {
    pub content: String,
    pub thought_type: String,
    pub verbosity: Verbosity,
}

/// The live handles a caller reads from. Dropping a receiver before the pipeline finishes simply
/// stops that derived stream from being read further; the background task keeps running because
/// the other receivers (and the aggregator) still need every upstream item.
pub struct PipelineHandles {
    pub content: mpsc::UnboundedReceiver<ContentFragment>,
    pub tags: mpsc::UnboundedReceiver<ThoughtFragment>,
    pub tool_calls: mpsc::UnboundedReceiver<ToolCall>,
    pub aggregated: oneshot::Receiver<Result<AggregatedRecord, PipelineError>>,
}

/// Convert one wire-shaped [`MessageChunk`] into the aggregator's provider-agnostic
/// [`ChoiceDelta`] shape.
fn chunk_to_choice_delta(chunk: MessageChunk) -> ChoiceDelta {
    ChoiceDelta {
        index: chunk.index,
        content: (!chunk.content.is_empty()).then_some(chunk.content),
        tool_calls: chunk
            .tool_calls
            .into_iter()
            .map(|tc| ToolCallDelta {
                index: tc.index,
                id: tc.id,
                name: tc.name,
                arguments_fragment: tc.arguments_fragment,
            })
            .collect(),
        finish_reason: chunk.finish_reason.as_deref().map(FinishReason::parse),
    }
}

/// Spawn the single upstream reader and return the four derived handles.
///
/// `recognised_tags` is the configured thought-tag name set (§6 Configuration); tags outside it
/// are discarded rather than surfaced as `thought-stream` events, per §4.3. `cancellation` is
/// raced against every upstream read (§5 requirement 1: "abort the in-flight provider HTTP
/// call") — once it fires, the task stops polling `upstream` and drops it rather than draining it
/// to completion, which is what actually tears down the underlying HTTP request.
pub fn run_pipeline(
    mut upstream: MessageChunkStream,
    recognised_tags: HashSet<String>,
    cancellation: CancellationToken,
) -> PipelineHandles {
    let (content_tx, content_rx) = mpsc::unbounded_channel();
    let (tags_tx, tags_rx) = mpsc::unbounded_channel();
    let (tool_calls_tx, tool_calls_rx) = mpsc::unbounded_channel();
    let (aggregated_tx, aggregated_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut aggregator = DeltaAggregator::new();
        let mut live_tag_parser = TagParser::new();
        let mut next_index: u64 = 0;
        let mut outcome: Result<(), PipelineError> = Ok(());

        loop {
            let item = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    log::debug!("pipeline cancelled, dropping upstream provider stream");
                    outcome = Err(PipelineError::UpstreamAborted("turn cancelled".to_string()));
                    break;
                }
                item = upstream.next() => item,
            };
            match item {
                Some(Ok(chunk)) => {
                    let delta = chunk_to_choice_delta(chunk);
                    if let Some(content) = &delta.content {
                        for event in live_tag_parser.push_chunk(content) {
                            emit_parser_event(event, &recognised_tags, &content_tx, &tags_tx, &mut next_index);
                        }
                    }
                    aggregator.push(&delta);
                }
                Some(Err(err)) => {
                    log::error!("provider stream aborted mid-response: {err}");
                    outcome = Err(PipelineError::UpstreamAborted(err.to_string()));
                    break;
                }
                None => break,
            }
        }
        // Dropping `upstream` here (loop exit) tears down the underlying HTTP request whether we
        // exited on cancellation, an upstream error, or natural completion.
        drop(upstream);

        if outcome.is_ok() {
            for event in live_tag_parser.finish() {
                emit_parser_event(event, &recognised_tags, &content_tx, &tags_tx, &mut next_index);
            }
        }

        let record = aggregator.finish();
        // toolCalls stream emits its assembled entries once the upstream has terminated (§4.3:
        // "emits each entry as soon as the stream terminates (batched)").
        for tool_call in &record.tool_calls {
            let _ = tool_calls_tx.send(tool_call.clone());
        }

        let _ = aggregated_tx.send(match outcome {
            Ok(()) => Ok(record),
            Err(err) => Err(err),
        });
    });

    PipelineHandles {
        content: content_rx,
        tags: tags_rx,
        tool_calls: tool_calls_rx,
        aggregated: aggregated_rx,
    }
}

fn emit_parser_event(
    event: ParserEvent,
    recognised_tags: &HashSet<String>,
    content_tx: &mpsc::UnboundedSender<ContentFragment>,
    tags_tx: &mpsc::UnboundedSender<ThoughtFragment>,
    next_index: &mut u64,
) {
    match event {
        ParserEvent::Text(text) => {
            if text.is_empty() {
                return;
            }
            let index = *next_index;
            *next_index += 1;
            let _ = content_tx.send(ContentFragment { index, delta: text });
        }
        ParserEvent::Tag(tag) => {
            let thought_type = tag.attr("thoughtType").unwrap_or(&tag.name).to_string();
            if !recognised_tags.contains(&thought_type) && !recognised_tags.contains(&tag.name) {
                return;
            }
            let verbosity = tag.attr("verbosity").map(Verbosity::parse).unwrap_or_default();
            let _ = tags_tx.send(ThoughtFragment {
                content: tag.body.unwrap_or_default(),
                thought_type,
                verbosity,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::client_wrapper::ToolCallChunk;
    use futures_util::stream;

    fn recognised() -> HashSet<String> {
        ["thinking", "analysis", "reasoning", "planning", "reflection", "decision", "observation", "strategy"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn splits_content_and_tags() {
        let chunks: MessageChunkStream = Box::pin(stream::iter(vec![
            Ok(MessageChunk {
                content: "<thinking>reason-a</thinking>".to_string(),
                ..Default::default()
            }),
            Ok(MessageChunk {
                content: "Answer: 42".to_string(),
                finish_reason: Some("stop".to_string()),
                ..Default::default()
            }),
        ]));
        let mut handles = run_pipeline(chunks, recognised(), CancellationToken::new());

        let fragment = handles.content.recv().await.unwrap();
        assert_eq!(fragment.delta, "Answer: 42");
        assert_eq!(fragment.index, 0);

        let thought = handles.tags.recv().await.unwrap();
        assert_eq!(thought.thought_type, "thinking");
        assert_eq!(thought.content, "reason-a");

        let aggregated = handles.aggregated.await.unwrap().unwrap();
        assert_eq!(aggregated.content, "Answer: 42");
        assert_eq!(aggregated.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn unrecognised_tag_is_discarded() {
        let chunks: MessageChunkStream = Box::pin(stream::iter(vec![Ok(MessageChunk {
            content: "<unknown>x</unknown>rest".to_string(),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        })]));
        let mut handles = run_pipeline(chunks, recognised(), CancellationToken::new());
        let fragment = handles.content.recv().await.unwrap();
        assert_eq!(fragment.delta, "rest");
        assert!(handles.tags.try_recv().is_err());
    }

    #[tokio::test]
    async fn tool_calls_emitted_batched_after_completion() {
        let chunks: MessageChunkStream = Box::pin(stream::iter(vec![Ok(MessageChunk {
            tool_calls: vec![ToolCallChunk {
                index: 0,
                id: Some("c1".to_string()),
                name: Some("calc".to_string()),
                arguments_fragment: Some("{}".to_string()),
            }],
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        })]));
        let mut handles = run_pipeline(chunks, recognised(), CancellationToken::new());
        let tool_call = handles.tool_calls.recv().await.unwrap();
        assert_eq!(tool_call.id, "c1");
        assert_eq!(tool_call.name, "calc");
    }

    #[tokio::test]
    async fn upstream_error_propagates_to_aggregated_receiver() {
        let chunks: MessageChunkStream = Box::pin(stream::iter(vec![Err(
            Box::<dyn std::error::Error>::from("boom"),
        )]));
        let mut handles = run_pipeline(chunks, recognised(), CancellationToken::new());
        assert!(handles.content.recv().await.is_none());
        let result = handles.aggregated.await.unwrap();
        assert!(matches!(result, Err(PipelineError::UpstreamAborted(_))));
    }

    #[tokio::test]
    async fn cancellation_aborts_stalled_upstream() {
        let chunks: MessageChunkStream = Box::pin(stream::pending());
        let cancellation = CancellationToken::new();
        let mut handles = run_pipeline(chunks, recognised(), cancellation.clone());

        cancellation.cancel();

        assert!(handles.content.recv().await.is_none());
        let result = handles.aggregated.await.unwrap();
        assert!(matches!(result, Err(PipelineError::UpstreamAborted(_))));
    }
}
