//! Observer hooks for the execution loop.
//!
//! Hooks receive shared references only, so they can watch a run but never change
//! its history, trajectory, or stats.

use std::rc::Rc;

use crate::core::stats::ApiStats;
use crate::core::types::{HistoryEntry, SplitAction, TrajectoryStep};

/// Lifecycle listener. Every method defaults to a no-op.
pub trait AgentHook {
    /// Called once when the hook is attached.
    fn on_init(&self) {}

    /// Called before an entry is appended to the runtime's history.
    fn on_query_message_added(&self, _entry: &HistoryEntry) {}

    fn on_run_start(&self) {}

    fn on_step_start(&self) {}

    /// The owner-scoped history about to be sent to the model.
    fn on_model_query(&self, _history: &[HistoryEntry], _agent: &str) {}

    fn on_actions_generated(&self, _thought: &str, _action: &str, _output: &str) {}

    fn on_sub_action_started(&self, _sub_action: &SplitAction) {}

    fn on_sub_action_executed(&self, _observation: Option<&str>, _done: bool) {}

    fn on_step_done(&self, _step: &TrajectoryStep, _stats: &ApiStats) {}

    fn on_run_done(&self) {}
}

/// Ordered hook list shared by a runtime and the subroutine runtimes it creates.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Rc<dyn AgentHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Rc<dyn AgentHook>) {
        hook.on_init();
        self.hooks.push(hook);
    }

    pub fn each(&self, f: impl Fn(&dyn AgentHook)) {
        for hook in &self.hooks {
            f(hook.as_ref());
        }
    }
}
