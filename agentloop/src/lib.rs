//! Execution core of an autonomous command-line agent.
//!
//! A model proposes shell actions; the runtime validates them, splits them into
//! dispatch units, runs them in a sandboxed [`io::environment::Environment`], and
//! feeds the observations back until the episode ends. Named subroutines run nested
//! agents on the same environment. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (pattern tables, guard, splitter,
//!   parsers, history filtering). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config files, models, shell sessions,
//!   trajectory files). Behind traits so tests can script them.
//!
//! Orchestration modules ([`agent`], [`retry`], [`subroutine`], [`replay`])
//! coordinate core logic with I/O.

pub mod agent;
pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
pub mod replay;
pub mod retry;
pub mod subroutine;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
