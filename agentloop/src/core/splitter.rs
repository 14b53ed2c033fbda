//! Greedy action splitter.
//!
//! Partitions a guarded action block into ordered dispatch units. Output order equals
//! textual order, which the execution loop relies on for causal dispatch.

use crate::core::patterns::{PatternTables, PatternView};
use crate::core::types::SplitAction;

/// Split `action` into plain commands and named calls, leftmost match first.
///
/// `agent` is the owning runtime's name, used for plain commands, submit, and block
/// commands matched from the command table. Only subroutine matches carry another
/// agent's name.
pub fn split_actions(
    action: &str,
    tables: &PatternTables,
    view: PatternView,
    agent: &str,
) -> Vec<SplitAction> {
    let mut parsed = Vec::new();
    let mut rest = action;
    while !rest.trim().is_empty() {
        let Some(found) = tables.first_match(rest, view) else {
            parsed.push(plain(agent, rest));
            break;
        };
        let pre = &rest[..found.start];
        let matched = &rest[found.start..found.end];
        rest = &rest[found.end..];

        if !pre.trim().is_empty() {
            parsed.push(plain(agent, pre));
        }
        if matched.trim().is_empty() {
            continue;
        }
        let unit = if found.name == tables.submit_command() {
            // Submit ends the owning level; it is never a delegation.
            SplitAction {
                agent: agent.to_string(),
                action: matched.to_string(),
                cmd_name: Some(found.name.to_string()),
                args: None,
            }
        } else {
            let owner = if found.delegates { found.name } else { agent };
            SplitAction {
                agent: owner.to_string(),
                action: matched.to_string(),
                cmd_name: Some(found.name.to_string()),
                args: Some(found.args.to_string()),
            }
        };
        parsed.push(unit);
    }
    parsed
}

fn plain(agent: &str, text: &str) -> SplitAction {
    SplitAction {
        agent: agent.to_string(),
        action: text.to_string(),
        cmd_name: None,
        args: None,
    }
}
