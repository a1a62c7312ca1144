//! Runtime configuration.
//!
//! Provides [`RuntimeConfig`], a plain struct covering every tunable the core recognises: the
//! turn loop's iteration cap and tool-error policy, the provider call timeout, the event ring
//! buffer's per-context capacity, the SSE router's default subscriber filtering, and the set of
//! inline-tag names the streaming pipeline treats as thought tags rather than content. Users
//! construct it by hand; no file-format parsing dependency is introduced.
//!
//! # Example
//!
//! ```rust
//! use turnflow::runtime::config::RuntimeConfig;
//!
//! // Defaults match the values the turn loop and SSE router fall back to on their own.
//! let config = RuntimeConfig::default();
//! assert_eq!(config.max_iterations, 10);
//!
//! // Or override what matters for a given deployment.
//! let config = RuntimeConfig {
//!     max_iterations: 25,
//!     stop_on_tool_error: true,
//!     ..RuntimeConfig::default()
//! };
//! assert!(config.stop_on_tool_error);
//! ```

use std::collections::HashSet;
use std::time::Duration;

/// Global configuration for the turn loop, streaming pipeline, and SSE delivery layer.
///
/// This struct is intentionally minimal: every field has a sensible default, and callers override
/// only what they need. No TOML, YAML, or other config-file parsing dependency is introduced —
/// construct it directly or via [`RuntimeConfig::default`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of iterations a single turn may run before the loop stops requesting
    /// further iterations, finalising with whatever `content-complete` the last one produced
    /// (§4.6: reaching the cap is a success, not an error). Guards against a tool-call loop that
    /// never terminates on its own.
    pub max_iterations: u32,
    /// When `true`, a failed tool execution ends the turn immediately after that iteration
    /// finishes (still emitting `tool-complete{success:false}` and the turn's own completion
    /// events) instead of feeding the failure back as a tool message for another iteration. When
    /// `false` (the default), the failure is surfaced as a tool message and the loop continues.
    pub stop_on_tool_error: bool,
    /// Timeout applied to each provider HTTP call.
    pub provider_timeout: Duration,
    /// Number of events retained per context in the replay ring buffer (C9). Subscribers
    /// reconnecting with a `Last-Event-ID` older than the oldest retained event receive only
    /// what's left in the buffer, not a gap-filled history.
    pub ring_buffer_capacity: usize,
    /// Default for a subscriber's `filterInternal` flag (C10) when not explicitly set on the
    /// subscription: drop event kinds that start with `internal:` or that appear on
    /// [`RuntimeConfig::internal_debug_kinds`].
    pub filter_internal: bool,
    /// Event kind names additionally treated as internal/debug-only even though they don't
    /// carry the `internal:` prefix, subject to [`RuntimeConfig::filter_internal`].
    pub internal_debug_kinds: HashSet<String>,
    /// Inline-tag names the streaming pipeline (C2/C4) routes to the thought stream instead of
    /// the content stream. A tag not in this set passes through as ordinary content text.
    pub recognised_thought_tags: HashSet<String>,
}

impl Default for RuntimeConfig {
    /// Builds the configuration the turn loop and SSE router use when no override is supplied:
    /// 10 iterations, tool errors are non-fatal, a 60 second provider timeout, a 256-event replay
    /// buffer per context, internal events filtered out of subscriptions by default, and the
    /// stock set of thought-tag names (`thinking`, `analysis`, `reasoning`, `planning`,
    /// `reflection`, `decision`, `observation`, `strategy`).
    ///
    /// # Example
    ///
    /// ```rust
    /// use turnflow::runtime::config::RuntimeConfig;
    ///
    /// let config = RuntimeConfig::default();
    /// assert_eq!(config.max_iterations, 10);
    /// assert!(!config.stop_on_tool_error);
    /// assert!(config.recognised_thought_tags.contains("thinking"));
    /// ```
    fn default() -> Self {
        Self {
            max_iterations: 10,
            stop_on_tool_error: false,
            provider_timeout: Duration::from_secs(60),
            ring_buffer_capacity: 256,
            filter_internal: true,
            internal_debug_kinds: HashSet::new(),
            recognised_thought_tags: default_thought_tags(),
        }
    }
}

fn default_thought_tags() -> HashSet<String> {
    [
        "thinking",
        "analysis",
        "reasoning",
        "planning",
        "reflection",
        "decision",
        "observation",
        "strategy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
