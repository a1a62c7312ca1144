// src/lib.rs
//
// `turnflow` is the reactive core of an LLM agent framework: a turn loop that alternates LLM
// calls and tool executions, a streaming pipeline that fans one provider delta stream into
// content/thought/tool-call/aggregated derived streams behind a single shared subscription, a
// tool dispatcher with lifecycle events and child-task propagation, and (behind the `server`
// feature) an SSE event bus with reconnect replay.

pub mod runtime;

// Flattened re-export so callers write `turnflow::client_wrapper::X` rather than
// `turnflow::runtime::client_wrapper::X` — the inner module boundary is purely an
// implementation-side grouping.
pub use runtime::*;

/// Initialise `env_logger` once, idempotently. Safe to call from multiple test binaries.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
