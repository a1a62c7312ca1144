//! Built-in Tool Implementations
//!
//! Concrete tools that can be wired into a [`ToolRegistry`](crate::tool_protocol::ToolRegistry)
//! through an adapter in [`tool_protocols`](crate::tool_protocols). This module currently ships
//! one: a stateless, thread-safe scientific calculator, used throughout the test suite and
//! examples as the canonical "first tool" a reader reaches for when wiring up a provider.
//!
//! # Integration
//!
//! ```ignore
//! use turnflow::tools::Calculator;
//! use turnflow::tool_protocols::CalculatorToolProvider;
//! use turnflow::tool_protocol::ToolRegistry;
//! use std::sync::Arc;
//!
//! let registry = ToolRegistry::new(Arc::new(CalculatorToolProvider::new(Calculator::new())));
//! ```

pub mod calculator;

pub use calculator::{Calculator, CalculatorError, CalculatorResult};
