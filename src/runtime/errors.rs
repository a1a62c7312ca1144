//! Error taxonomy for the reactive agent runtime.
//!
//! Hand-rolled error enums in the style of `clients::common::StreamError` rather than a derive
//! macro. Each subsystem boundary gets its own enum; [`CoreError`] is the crate-level union the
//! turn loop surfaces to callers.

use std::error::Error;
use std::fmt;

/// Errors raised while dispatching a single tool call (C5).
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// No registered provider's `get_tool` returned a definition for this name.
    ///
    /// This is never surfaced as a hard failure — the dispatcher logs a warning and
    /// passes the original `tool-call` event through unchanged. The variant exists so callers that
    /// want to observe the condition (e.g. the host's own tests) can match on it.
    ToolNotFound(String),
    /// The provider's `execute_tool` call failed, either synchronously or mid-stream.
    ExecutionFailed(String),
    /// Tool call arguments failed the dispatcher's structural validation against the tool's
    /// parameter schema.
    InvalidArguments(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ToolNotFound(name) => write!(f, "no provider resolved tool: {name}"),
            DispatchError::ExecutionFailed(msg) => write!(f, "tool execution failed: {msg}"),
            DispatchError::InvalidArguments(msg) => write!(f, "invalid tool arguments: {msg}"),
        }
    }
}

impl Error for DispatchError {}

/// Errors raised while fanning a provider stream through the pipeline (C4) or aggregating it (C3).
///
/// The single-subscription invariant (§4.3, §5) is enforced structurally instead: `run_pipeline`
/// takes ownership of the upstream `MessageChunkStream`, so a second subscription is a compile
/// error, not a runtime one, and has no corresponding variant here.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// The upstream provider stream ended with a transport/HTTP error mid-response.
    UpstreamAborted(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::UpstreamAborted(msg) => write!(f, "provider stream aborted: {msg}"),
        }
    }
}

impl Error for PipelineError {}

/// Errors surfaced from the turn loop (C7) itself — distinct from the non-fatal tool/provider
/// failures that are recovered into `tool-complete`/`content-complete` events.
#[derive(Debug, Clone)]
pub enum TurnError {
    /// A transient provider error (§7): HTTP 5xx, timeout, or stream abort mid-response.
    Provider(String),
    /// The turn was cancelled via the cooperative cancellation signal (§5).
    Cancelled,
    /// An internal invariant was violated (§7) — e.g. a pipeline subscribed to its upstream twice.
    Invariant(String),
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Provider(msg) => write!(f, "provider error: {msg}"),
            TurnError::Cancelled => write!(f, "turn cancelled"),
            TurnError::Invariant(msg) => write!(f, "internal invariant violated: {msg}"),
        }
    }
}

impl Error for TurnError {}

impl From<PipelineError> for TurnError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UpstreamAborted(msg) => TurnError::Provider(msg),
        }
    }
}

/// Crate-level error union returned by the public turn-loop API.
#[derive(Debug, Clone)]
pub enum CoreError {
    Turn(TurnError),
    Dispatch(DispatchError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Turn(e) => write!(f, "{e}"),
            CoreError::Dispatch(e) => write!(f, "{e}"),
        }
    }
}

impl Error for CoreError {}

impl From<TurnError> for CoreError {
    fn from(err: TurnError) -> Self {
        CoreError::Turn(err)
    }
}

impl From<DispatchError> for CoreError {
    fn from(err: DispatchError) -> Self {
        CoreError::Dispatch(err)
    }
}
