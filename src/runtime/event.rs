//! Event model & IDs (C1).
//!
//! Every observable thing the runtime does — a turn starting, a content fragment arriving, a tool
//! finishing — is one [`Event`]: a common envelope (`contextId`/`taskId`/`timestamp`/`path`/
//! `parentTaskId`) wrapping a tagged [`EventKind`]. The envelope shape and the kind list are fixed
//! by the wire contract; everything downstream (the ring buffer, the SSE router, the
//! message-history assembler) consumes `Event` values rather than inventing its own notion of
//! "thing that happened".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::tool_protocol::ToolCall;

/// Terminal condition reported by an LLM provider for one `content-complete`.
///
/// `ToolCalls` is the sole non-terminal value: it tells the turn loop (C7) to run another
/// iteration rather than finalise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FinishReason::ToolCalls)
    }

    /// Parse a provider's raw finish-reason string (e.g. `"stop"`, `"tool_calls"`). Unrecognised
    /// values map to `Error` rather than panicking — an upstream that sends a reason we don't know
    /// about shouldn't take down the turn.
    pub fn parse(raw: &str) -> FinishReason {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }
}

/// Status carried by a `task-status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    Failed,
    Canceled,
}

/// Verbosity attribute on a `thought-stream` event, taken from the inline tag's `verbosity`
/// attribute; defaults to `Normal` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Low,
    Normal,
    High,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Normal
    }
}

impl Verbosity {
    pub fn parse(raw: &str) -> Verbosity {
        match raw {
            "low" => Verbosity::Low,
            "high" => Verbosity::High,
            _ => Verbosity::Normal,
        }
    }
}

/// The variant payload of an event, tagged by its discriminator.
///
/// The `#[serde(tag = "kind")]` representation is an implementation convenience for
/// (de)serialising the envelope as one flat JSON object; it is not the wire `kind` string used on
/// the SSE `event:` line (see [`Event::kind_name`]), which needs the dynamic `internal:<topic>`
/// prefix that a static serde tag can't express.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventKind {
    TaskCreated,
    TaskStatus {
        status: TaskStatus,
    },
    TaskComplete {
        content: String,
        finish_reason: FinishReason,
    },
    ContentDelta {
        delta: String,
        index: u64,
    },
    ContentComplete {
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
        finish_reason: FinishReason,
    },
    ThoughtStream {
        content: String,
        thought_type: String,
        verbosity: Verbosity,
    },
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
    ToolProgress {
        tool_call_id: String,
        message: String,
    },
    ToolComplete {
        tool_call_id: String,
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ArtifactUpdate {
        artifact_id: String,
        artifact_kind: String,
        data: Value,
    },
    Internal {
        topic: String,
        payload: Value,
    },
    Authentication {
        status: String,
    },
    SubAgentLinked {
        child_name: String,
        child_task_id: String,
    },
}

/// Common envelope shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub context_id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    /// Ordered scope tags, e.g. `["agent:x", "tool:y"]`, prepended to as an event crosses an
    /// agent-as-tool boundary (§4.4).
    #[serde(default)]
    pub path: Vec<String>,
    /// Set when the event originates from a sub-task. If present, C8 MUST NOT fold this event
    /// into the parent's history (§3 invariant, §4.4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(context_id: impl Into<String>, task_id: impl Into<String>, kind: EventKind) -> Self {
        Event {
            context_id: context_id.into(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            path: Vec::new(),
            parent_task_id: None,
            kind,
        }
    }

    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    pub fn with_parent_task_id(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Prepend a path segment, used when an event crosses an agent-as-tool boundary (§4.4: "a new
    /// path segment `agent:<childName>` prepended to any path the child emitted").
    pub fn prepend_path_segment(mut self, segment: impl Into<String>) -> Self {
        self.path.insert(0, segment.into());
        self
    }

    /// The wire discriminator string used on the SSE `event:` line and for `filterInternal`
    /// matching (§4.9). Distinct from the serde derive's static tag because `Internal` needs a
    /// dynamic `internal:<topic>` suffix.
    pub fn kind_name(&self) -> String {
        match &self.kind {
            EventKind::TaskCreated => "task-created".to_string(),
            EventKind::TaskStatus { .. } => "task-status".to_string(),
            EventKind::TaskComplete { .. } => "task-complete".to_string(),
            EventKind::ContentDelta { .. } => "content-delta".to_string(),
            EventKind::ContentComplete { .. } => "content-complete".to_string(),
            EventKind::ThoughtStream { .. } => "thought-stream".to_string(),
            EventKind::ToolStart { .. } => "tool-start".to_string(),
            EventKind::ToolProgress { .. } => "tool-progress".to_string(),
            EventKind::ToolComplete { .. } => "tool-complete".to_string(),
            EventKind::ArtifactUpdate { .. } => "artifact-update".to_string(),
            EventKind::Internal { topic, .. } => format!("internal:{topic}"),
            EventKind::Authentication { .. } => "authentication".to_string(),
            EventKind::SubAgentLinked { .. } => "sub-agent-linked".to_string(),
        }
    }

    /// True for any `internal:*` kind — the default `filterInternal` predicate (§4.9) drops these.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, EventKind::Internal { .. })
    }
}

/// A lifecycle transition reported to an [`EventHandler`] alongside the raw event stream.
///
/// These don't have a wire representation of their own; they're synthesised by the turn loop (C7)
/// and iteration executor (C6) purely for process-local observers (spec-supplemented feature, see
/// `SPEC_FULL.md` section B.1).
#[derive(Debug, Clone)]
pub enum LifecycleTransition {
    IterationStarted { task_id: String, iteration: u32 },
    IterationCompleted { task_id: String, iteration: u32 },
    ToolDispatched { task_id: String, tool_name: String },
}

/// Process-local observer of runtime events, parallel to the SSE bus (C10).
///
/// A host embedding this crate as a
/// library can implement this to react to turn-loop activity without standing up an HTTP
/// subscriber. Both methods default to no-ops so implementors only override what they need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &Event) {}

    async fn on_lifecycle(&self, _transition: &LifecycleTransition) {}
}

/// An [`EventHandler`] that does nothing, used as the default when a host doesn't supply one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}
