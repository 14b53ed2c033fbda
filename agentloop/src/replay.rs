//! Resume a run from a saved trajectory.
//!
//! The checkpoint's history and stats are restored, then every recorded action is
//! sent through the environment again so the sandbox reaches the state it had when
//! the checkpoint was written. Actions are guarded and split exactly as live
//! dispatch does. A recorded subroutine call is replayed from the nested agent's own
//! turns in the restored history, so the model is never queried and the restored
//! history and stats stay as they were. A run whose last step was a cost exit
//! resumes as if that exit never happened.

use std::collections::VecDeque;

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::core::guard::guard_multiline_input;
use crate::core::patterns::{PatternTables, PatternView};
use crate::core::splitter::split_actions;
use crate::core::stats::ApiStats;
use crate::core::types::{ExitStatus, HistoryEntry, Info, Role, SplitAction, TrajectoryStep};
use crate::io::environment::Environment;
use crate::io::trajectory::Checkpoint;

/// A runtime that can absorb a checkpoint.
pub trait ReplayTarget {
    fn name(&self) -> &str;

    fn patterns(&self) -> &PatternTables;

    /// Replace the history and the model's counters.
    fn restore(&mut self, history: Vec<HistoryEntry>, stats: &ApiStats);

    /// Execute one recorded unit against the environment. Delegated units draw the
    /// nested agent's actions from `turns`.
    fn replay_unit(
        &mut self,
        unit: &SplitAction,
        env: &mut dyn Environment,
        turns: &mut RecordedTurns,
    ) -> Result<ReplayedUnit>;
}

#[derive(Debug, Default)]
pub struct ReplayedUnit {
    pub done: bool,
    pub info: Info,
}

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Restored trajectory; the live loop appends to it.
    pub trajectory: Vec<TrajectoryStep>,
    pub info: Info,
    /// A replayed unit ended the episode; the live loop must not start.
    pub done: bool,
}

/// Actions that nested agents took in a recorded run, in history order.
#[derive(Debug, Clone, Default)]
pub struct RecordedTurns {
    turns: VecDeque<(String, String)>,
}

impl RecordedTurns {
    /// Every non-demo assistant action in `history` not owned by `root`.
    pub fn from_history(history: &[HistoryEntry], root: &str) -> Self {
        let turns = history
            .iter()
            .filter(|e| e.role == Role::Assistant && !e.is_demo() && !e.is_owned_by(root))
            .filter_map(|e| Some((e.agent.clone()?, e.action.clone()?)))
            .collect();
        Self { turns }
    }

    /// Take the earliest remaining action recorded for `agent`.
    pub fn next_for(&mut self, agent: &str) -> Option<String> {
        let idx = self.turns.iter().position(|(owner, _)| owner == agent)?;
        self.turns.remove(idx).map(|(_, action)| action)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Drop a dangling trailing cost exit from `checkpoint`.
///
/// The last history entry must be the matching assistant turn, otherwise the
/// checkpoint is rejected as corrupt.
pub fn strip_cost_exit(checkpoint: &mut Checkpoint) -> Result<bool> {
    let is_cost_exit = checkpoint
        .trajectory
        .last()
        .is_some_and(|step| ExitStatus::from_action(&step.action) == Some(ExitStatus::Cost));
    if !is_cost_exit {
        return Ok(false);
    }
    let paired = checkpoint.history.last().is_some_and(|entry| {
        entry.role == Role::Assistant
            && entry
                .action
                .as_deref()
                .and_then(ExitStatus::from_action)
                == Some(ExitStatus::Cost)
    });
    if !paired {
        bail!("corrupt checkpoint: trailing exit_cost step has no matching assistant entry");
    }
    checkpoint.trajectory.pop();
    checkpoint.history.pop();
    Ok(true)
}

/// Restore `checkpoint` into `target` and replay its actions through `env`.
pub fn replay_checkpoint(
    target: &mut dyn ReplayTarget,
    mut checkpoint: Checkpoint,
    env: &mut dyn Environment,
) -> Result<ReplayOutcome> {
    if strip_cost_exit(&mut checkpoint)? {
        info!("dropped trailing exit_cost step from checkpoint");
    }
    let Checkpoint {
        trajectory,
        history,
        info: checkpoint_info,
    } = checkpoint;
    let mut turns = RecordedTurns::from_history(&history, target.name());
    target.restore(history, &checkpoint_info.model_stats);

    let mut outcome = ReplayOutcome::default();
    for step in &trajectory {
        let replayed = replay_action(target, &step.action, env, &mut turns)?;
        outcome.info.merge(replayed.info);
        if replayed.done {
            outcome.done = true;
            break;
        }
    }
    if !turns.is_empty() {
        debug!(unused = turns.len(), "recorded nested turns left after replay");
    }
    info!(steps = trajectory.len(), done = outcome.done, "checkpoint replayed");
    outcome.trajectory = trajectory;
    Ok(outcome)
}

/// Re-dispatch one recorded action block. Stops at the first unit that ends the
/// episode.
pub fn replay_action(
    target: &mut dyn ReplayTarget,
    action: &str,
    env: &mut dyn Environment,
    turns: &mut RecordedTurns,
) -> Result<ReplayedUnit> {
    if let Some(status) = ExitStatus::from_action(action) {
        return replay_exit(status, env);
    }
    let guarded = guard_multiline_input(action, target.patterns());
    let units = split_actions(
        &guarded,
        target.patterns(),
        PatternView::Subroutine,
        target.name(),
    );
    let mut replayed = ReplayedUnit::default();
    for unit in &units {
        debug!(agent = %unit.agent, action = %unit.action, "replaying unit");
        let result = target.replay_unit(unit, env, turns)?;
        replayed.info.merge(result.info);
        if result.done {
            replayed.done = true;
            break;
        }
    }
    Ok(replayed)
}

/// Send a recorded exit sentinel to the environment. It always ends the level.
pub fn replay_exit(status: ExitStatus, env: &mut dyn Environment) -> Result<ReplayedUnit> {
    let result = env.step(status.as_action())?;
    let mut info = result.info;
    if info.exit_status.is_none() {
        info.exit_status = Some(status.to_string());
    }
    Ok(ReplayedUnit { done: true, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::trajectory::CheckpointInfo;

    fn step(action: &str) -> TrajectoryStep {
        TrajectoryStep {
            action: action.to_string(),
            observation: String::new(),
            response: String::new(),
            state: None,
            thought: String::new(),
        }
    }

    fn checkpoint(actions: &[&str], history: Vec<HistoryEntry>) -> Checkpoint {
        Checkpoint {
            trajectory: actions.iter().map(|a| step(a)).collect(),
            history,
            info: CheckpointInfo {
                model_stats: ApiStats::default(),
            },
        }
    }

    #[test]
    fn trailing_cost_exit_is_removed_with_its_entry() {
        let mut cp = checkpoint(
            &["ls", "exit_cost"],
            vec![
                HistoryEntry::assistant("ls", "", "ls", "primary"),
                HistoryEntry::assistant("Exit due to cost limit", "", "exit_cost", "primary"),
            ],
        );
        assert!(strip_cost_exit(&mut cp).expect("strip"));
        assert_eq!(cp.trajectory.len(), 1);
        assert_eq!(cp.history.len(), 1);
    }

    #[test]
    fn unpaired_cost_exit_is_corrupt() {
        let mut cp = checkpoint(
            &["exit_cost"],
            vec![HistoryEntry::user("observation", "primary")],
        );
        let err = strip_cost_exit(&mut cp).expect_err("corrupt");
        assert!(err.to_string().contains("corrupt checkpoint"));
    }

    #[test]
    fn recorded_turns_are_taken_per_agent_in_order() {
        let history = vec![
            HistoryEntry::assistant("a", "", "locate x", "primary"),
            HistoryEntry::assistant("b", "", "open a.py", "locate"),
            HistoryEntry::user("obs", "locate"),
            HistoryEntry::assistant("c", "", "plan\nstep\nend_plan", "reviewer"),
            HistoryEntry::assistant("d", "", "submit", "locate"),
            HistoryEntry {
                is_demo: Some(true),
                ..HistoryEntry::assistant("e", "", "ls", "locate")
            },
        ];
        let mut turns = RecordedTurns::from_history(&history, "primary");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns.next_for("locate").as_deref(), Some("open a.py"));
        assert_eq!(turns.next_for("locate").as_deref(), Some("submit"));
        assert_eq!(turns.next_for("locate"), None);
        assert_eq!(
            turns.next_for("reviewer").as_deref(),
            Some("plan\nstep\nend_plan")
        );
        assert!(turns.is_empty());
    }

    #[test]
    fn other_endings_are_left_alone() {
        let mut cp = checkpoint(&["ls"], Vec::new());
        assert!(!strip_cost_exit(&mut cp).expect("strip"));
        assert_eq!(cp.trajectory.len(), 1);
    }
}
