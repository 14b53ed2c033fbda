//! Owner-scoped history views and history processors.

use serde::{Deserialize, Serialize};

use crate::core::types::{HistoryEntry, Role};

/// Entries owned by `agent`, in order. This is the only history a runtime sends to
/// its model, even though nested agents append into the same list.
pub fn owned_history(history: &[HistoryEntry], agent: &str) -> Vec<HistoryEntry> {
    history
        .iter()
        .filter(|entry| entry.is_owned_by(agent))
        .cloned()
        .collect()
}

/// Demonstration entries visible to `agent`: untagged entries and entries tagged with
/// its own name.
pub fn demo_entries_for(entries: Vec<HistoryEntry>, agent: &str) -> Vec<HistoryEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.agent.is_none() || entry.is_owned_by(agent))
        .collect()
}

/// Flatten a demonstration into a single transcript string.
pub fn demonstration_transcript(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .filter(|entry| entry.role != Role::System)
        .map(|entry| entry.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Transform applied to the owned history right before a model query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryProcessor {
    #[default]
    Default,
    /// Elide all but the last `n` observations. The first observation (the instance
    /// prompt) and demonstration entries are always kept.
    LastNObservations { n: usize },
}

impl HistoryProcessor {
    pub fn apply(self, history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        match self {
            HistoryProcessor::Default => history,
            HistoryProcessor::LastNObservations { n } => keep_last_n_observations(history, n),
        }
    }
}

fn keep_last_n_observations(mut history: Vec<HistoryEntry>, n: usize) -> Vec<HistoryEntry> {
    let observations: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.role == Role::User && !entry.is_demo())
        .map(|(idx, _)| idx)
        .collect();
    if observations.len() <= n + 1 {
        return history;
    }
    let elide_until = observations.len() - n;
    for &idx in &observations[1..elide_until] {
        let entry = &mut history[idx];
        let lines = entry.content.lines().count();
        entry.content = format!("Old output omitted ({lines} lines)");
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo(content: &str, agent: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            agent: agent.map(str::to_string),
            is_demo: Some(true),
            ..HistoryEntry::user(content, "x")
        }
    }

    #[test]
    fn owned_history_filters_by_owner() {
        let history = vec![
            HistoryEntry::system("sys", "primary"),
            HistoryEntry::system("sub sys", "sub"),
            HistoryEntry::user("obs", "primary"),
        ];
        let owned = owned_history(&history, "primary");
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|e| e.is_owned_by("primary")));
    }

    #[test]
    fn demo_entries_keep_untagged_and_own() {
        let entries = vec![
            demo("a", None),
            demo("b", Some("primary")),
            demo("c", Some("other")),
        ];
        let kept = demo_entries_for(entries, "primary");
        let contents: Vec<&str> = kept.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[test]
    fn transcript_skips_system_messages() {
        let entries = vec![
            HistoryEntry::system("sys", "p"),
            HistoryEntry::user("issue", "p"),
            HistoryEntry::assistant("run ls", "t", "ls", "p"),
        ];
        assert_eq!(demonstration_transcript(&entries), "issue\nrun ls");
    }

    #[test]
    fn last_n_observations_elides_middle_observations() {
        let history = vec![
            HistoryEntry::system("sys", "p"),
            HistoryEntry::user("instance", "p"),
            HistoryEntry::user("obs1\nline", "p"),
            HistoryEntry::user("obs2", "p"),
            HistoryEntry::user("obs3", "p"),
        ];
        let processed = HistoryProcessor::LastNObservations { n: 2 }.apply(history);
        let contents: Vec<&str> = processed.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["sys", "instance", "Old output omitted (2 lines)", "obs2", "obs3"]
        );
    }

    #[test]
    fn default_processor_is_identity() {
        let history = vec![HistoryEntry::user("a", "p")];
        assert_eq!(HistoryProcessor::Default.apply(history.clone()), history);
    }
}
