//! Per-iteration prompt template choice.

use serde::{Deserialize, Serialize};

use crate::core::types::{HistoryEntry, Role};

/// Result of the retrieval command, carried into the next iteration's prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodegraphContext {
    pub search_term: String,
    pub context: String,
}

/// Which template set renders the next user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateChoice {
    /// First turn after the system message or demonstrations.
    Instance,
    /// The previous observation was empty.
    NoOutput,
    /// A retrieval result is pending.
    Codegraph,
    NextStep,
}

/// Pick exactly one template set for this iteration.
pub fn select_template(
    previous: Option<&HistoryEntry>,
    observation: Option<&str>,
    codegraph: Option<&CodegraphContext>,
) -> TemplateChoice {
    let after_preamble = previous.is_none_or(|entry| entry.role == Role::System || entry.is_demo());
    if after_preamble {
        return TemplateChoice::Instance;
    }
    if observation.is_none_or(|obs| obs.trim().is_empty()) {
        return TemplateChoice::NoOutput;
    }
    if codegraph.is_some() {
        return TemplateChoice::Codegraph;
    }
    TemplateChoice::NextStep
}
