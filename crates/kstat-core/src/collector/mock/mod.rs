//! Mock kstat implementations for testing.
//!
//! This module provides `MockKstat` and pre-built scenarios for testing
//! collectors without access to a real illumos kernel.

mod scenarios;
mod source;

pub use source::{MockCalls, MockKstat, MockSession, MockValue};
