//! Cooperative cancellation shared by a whole call tree.
//!
//! The flag is for embedders: a host that owns the process hands a clone to
//! [`crate::agent::Agent::with_cancel`] and trips it from its own signal or shutdown
//! handling. The `agentloop` binary never sets it, so Ctrl-C there ends the
//! process directly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

/// Raised when a run is interrupted. Never converted into an exit sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("run interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// True if `err` (or anything in its chain) is an interrupt.
pub fn is_interrupt(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Interrupted>())
}

/// Clonable cancel flag. Every runtime in a call tree holds a clone of the root's flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Interrupted.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(clone.check().is_ok());
        flag.cancel();
        assert!(clone.is_cancelled());
        let err = clone.check().expect_err("interrupted");
        assert!(is_interrupt(&err));
    }

    #[test]
    fn interrupt_is_found_through_context() {
        let err = Err::<(), _>(anyhow::Error::from(Interrupted))
            .context("query model")
            .expect_err("err");
        assert!(is_interrupt(&err));
        assert!(!is_interrupt(&anyhow::anyhow!("other")));
    }
}
