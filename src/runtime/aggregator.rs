//! Delta aggregator (C3).
//!
//! Consumes a stream of provider choice-delta records and reduces it to exactly one aggregated
//! record on completion: concatenated content (run through the inline-tag parser so extracted
//! tags come out as a separate `thoughts` list), tool calls assembled by index, and the last
//! non-null finish reason. A sibling [`UsageAggregator`] sums the numeric usage counters the same
//! way [`client_wrapper::TokenUsage`](crate::runtime::client_wrapper::TokenUsage) tracks them,
//! generalised to arbitrary nested "cache counters" maps.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::runtime::event::FinishReason;
use crate::runtime::tag_parser::{ParserEvent, Tag, TagParser};
use crate::runtime::tool_protocol::ToolCall;

/// One incremental tool-call fragment, keyed by the provider's own `index` for that call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: u64,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Raw JSON-text fragment; arguments arrive character-by-character across deltas and are
    /// concatenated, not merged as JSON, until the call completes.
    pub arguments_fragment: Option<String>,
}

/// One provider choice-delta record, as fed to [`DeltaAggregator::push`] and to the pipeline (C4).
#[derive(Debug, Clone, Default)]
pub struct ChoiceDelta {
    pub index: u64,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments_raw: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ToolCall {
        let arguments = serde_json::from_str(&self.arguments_raw).unwrap_or_else(|_| {
            if self.arguments_raw.is_empty() {
                Value::Object(Default::default())
            } else {
                log::warn!("tool-call arguments did not parse as JSON, passing through as a string");
                Value::String(self.arguments_raw.clone())
            }
        });
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// The single record emitted when a choice-delta stream completes.
#[derive(Debug, Clone, Default)]
pub struct AggregatedRecord {
    pub content: String,
    pub thoughts: Vec<Tag>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
}

/// Accumulates one provider call's choice-delta stream into an [`AggregatedRecord`].
#[derive(Default)]
pub struct DeltaAggregator {
    content: String,
    thoughts: Vec<Tag>,
    tool_call_accumulators: BTreeMap<u64, ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
    tag_parser: TagParser,
}

impl DeltaAggregator {
    pub fn new() -> Self {
        DeltaAggregator::default()
    }

    pub fn push(&mut self, delta: &ChoiceDelta) {
        if let Some(content) = &delta.content {
            for event in self.tag_parser.push_chunk(content) {
                self.absorb_parser_event(event);
            }
        }
        for tool_call_delta in &delta.tool_calls {
            let accumulator = self
                .tool_call_accumulators
                .entry(tool_call_delta.index)
                .or_default();
            if let Some(id) = &tool_call_delta.id {
                if !id.is_empty() {
                    accumulator.id = id.clone();
                }
            }
            if let Some(name) = &tool_call_delta.name {
                if !name.is_empty() {
                    accumulator.name = name.clone();
                }
            }
            if let Some(fragment) = &tool_call_delta.arguments_fragment {
                accumulator.arguments_raw.push_str(fragment);
            }
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
    }

    fn absorb_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::Text(text) => self.content.push_str(&text),
            ParserEvent::Tag(tag) => self.thoughts.push(tag),
        }
    }

    /// Consume the aggregator and produce the final record. `BTreeMap` iteration already walks
    /// keys in ascending order, which gives the "ascending by index" ordering tool calls are assembled in.
    pub fn finish(mut self) -> AggregatedRecord {
        for event in self.tag_parser.finish() {
            self.absorb_parser_event(event);
        }
        let tool_calls = self
            .tool_call_accumulators
            .into_values()
            .map(ToolCallAccumulator::into_tool_call)
            .collect();
        AggregatedRecord {
            content: self.content,
            thoughts: self.thoughts,
            tool_calls,
            finish_reason: self.finish_reason,
        }
    }
}

/// Sums numeric usage fields across however many choice-delta records carry a `usage` payload,
/// recursively for nested "details" objects (cache-read counters and the like).
#[derive(Debug, Default)]
pub struct UsageAggregator {
    total: Value,
}

impl UsageAggregator {
    pub fn new() -> Self {
        UsageAggregator {
            total: Value::Object(Default::default()),
        }
    }

    pub fn add(&mut self, usage: &Value) {
        self.total = sum_values(&self.total, usage);
    }

    pub fn finish(self) -> Value {
        self.total
    }
}

fn sum_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            let mut merged = a_map.clone();
            for (key, b_value) in b_map {
                let next = match merged.get(key) {
                    Some(a_value) => sum_values(a_value, b_value),
                    None => b_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Number(a_num), Value::Number(b_num)) => {
            let sum = a_num.as_f64().unwrap_or(0.0) + b_num.as_f64().unwrap_or(0.0);
            if a_num.is_i64() && b_num.is_i64() {
                Value::from(sum as i64)
            } else {
                serde_json::json!(sum)
            }
        }
        (_, b) => b.clone(),
    }
}
