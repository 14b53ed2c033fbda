//! Deterministic, pure logic shared by the agent runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod blocklist;
pub mod commands;
pub mod guard;
pub mod history;
pub mod parsing;
pub mod patterns;
pub mod splitter;
pub mod stats;
pub mod template_select;
pub mod types;
