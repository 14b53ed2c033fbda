//! Shared deterministic types for the agent runtime.
//!
//! These types define stable contracts between core components and the persisted
//! trajectory format. They do not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::stats::ApiStats;

/// Speaker of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in an agent's conversation history.
///
/// `agent` is the owning runtime's name. A nested agent's history is spliced into the
/// caller's list unchanged, so the owner tag is what scopes each runtime's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_demo: Option<bool>,
}

impl HistoryEntry {
    pub fn system(content: impl Into<String>, agent: &str) -> Self {
        Self::message(Role::System, content, agent)
    }

    pub fn user(content: impl Into<String>, agent: &str) -> Self {
        Self::message(Role::User, content, agent)
    }

    pub fn assistant(
        content: impl Into<String>,
        thought: impl Into<String>,
        action: impl Into<String>,
        agent: &str,
    ) -> Self {
        Self {
            thought: Some(thought.into()),
            action: Some(action.into()),
            ..Self::message(Role::Assistant, content, agent)
        }
    }

    fn message(role: Role, content: impl Into<String>, agent: &str) -> Self {
        Self {
            role,
            content: content.into(),
            agent: Some(agent.to_string()),
            thought: None,
            action: None,
            is_demo: None,
        }
    }

    pub fn is_demo(&self) -> bool {
        self.is_demo.unwrap_or(false)
    }

    pub fn is_owned_by(&self, agent: &str) -> bool {
        self.agent.as_deref() == Some(agent)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One completed loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub action: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub observation: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub response: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub thought: String,
}

impl TrajectoryStep {
    pub fn field(&self, field: StepField) -> Option<String> {
        match field {
            StepField::Action => Some(self.action.clone()),
            StepField::Observation => Some(self.observation.clone()),
            StepField::Response => Some(self.response.clone()),
            StepField::State => self.state.clone(),
            StepField::Thought => Some(self.thought.clone()),
        }
    }
}

/// An atomic dispatch unit produced by the splitter.
///
/// `agent` is the owning runtime's name for plain commands and submit, or the
/// subroutine name for a delegated call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAction {
    pub agent: String,
    pub action: String,
    pub cmd_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

/// Terminal sentinels. Each is an ordinary action value so the loop can still record
/// and persist a final step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Format,
    Cost,
    Context,
    Api,
    Error,
}

impl ExitStatus {
    pub const ALL: [ExitStatus; 5] = [
        ExitStatus::Format,
        ExitStatus::Cost,
        ExitStatus::Context,
        ExitStatus::Api,
        ExitStatus::Error,
    ];

    pub fn as_action(self) -> &'static str {
        match self {
            ExitStatus::Format => "exit_format",
            ExitStatus::Cost => "exit_cost",
            ExitStatus::Context => "exit_context",
            ExitStatus::Api => "exit_api",
            ExitStatus::Error => "exit_error",
        }
    }

    /// Recognize a sentinel action (surrounding whitespace ignored).
    pub fn from_action(action: &str) -> Option<Self> {
        let action = action.trim();
        Self::ALL.into_iter().find(|s| s.as_action() == action)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_action())
    }
}

/// Field of the final trajectory step returned to a subroutine caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepField {
    Action,
    Observation,
    Response,
    State,
    Thought,
}

/// What `Agent::run` hands back when the loop reaches `DONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReturnType {
    Info,
    #[default]
    InfoTrajectory,
    Field(StepField),
}

impl TryFrom<String> for ReturnType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "info" => ReturnType::Info,
            "info_trajectory" => ReturnType::InfoTrajectory,
            "action" => ReturnType::Field(StepField::Action),
            "observation" => ReturnType::Field(StepField::Observation),
            "response" => ReturnType::Field(StepField::Response),
            "state" => ReturnType::Field(StepField::State),
            "thought" => ReturnType::Field(StepField::Thought),
            other => return Err(format!("unknown return_type '{other}'")),
        })
    }
}

impl From<ReturnType> for String {
    fn from(value: ReturnType) -> Self {
        match value {
            ReturnType::Info => "info",
            ReturnType::InfoTrajectory => "info_trajectory",
            ReturnType::Field(StepField::Action) => "action",
            ReturnType::Field(StepField::Observation) => "observation",
            ReturnType::Field(StepField::Response) => "response",
            ReturnType::Field(StepField::State) => "state",
            ReturnType::Field(StepField::Thought) => "thought",
        }
        .to_string()
    }
}

/// Accumulated run information: environment-reported fields plus model stats.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_stats: Option<ApiStats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Info {
    /// Fold another info record in; fields present in `other` win.
    pub fn merge(&mut self, other: Info) {
        if other.exit_status.is_some() {
            self.exit_status = other.exit_status;
        }
        if other.submission.is_some() {
            self.submission = other.submission;
        }
        if other.model_stats.is_some() {
            self.model_stats = other.model_stats;
        }
        self.extra.extend(other.extra);
    }
}

/// Result of a completed run, shaped by [`ReturnType`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    Info(Info),
    InfoTrajectory(Info, Vec<TrajectoryStep>),
    Value(Option<String>),
}

impl RunOutput {
    /// Render the output as the observation a subroutine caller sees.
    pub fn into_observation(self) -> Option<String> {
        match self {
            RunOutput::Value(value) => value,
            RunOutput::Info(info) | RunOutput::InfoTrajectory(info, _) => {
                serde_json::to_string(&info).ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_recognizes_sentinels_only() {
        assert_eq!(ExitStatus::from_action(" exit_cost\n"), Some(ExitStatus::Cost));
        assert_eq!(ExitStatus::from_action("exit_format"), Some(ExitStatus::Format));
        assert_eq!(ExitStatus::from_action("exit"), None);
        assert_eq!(ExitStatus::from_action("exit_cost now"), None);
    }

    #[test]
    fn return_type_parses_known_names() {
        let parsed: ReturnType = "observation".to_string().try_into().expect("parse");
        assert_eq!(parsed, ReturnType::Field(StepField::Observation));
        assert!(ReturnType::try_from("submission".to_string()).is_err());
        assert_eq!(String::from(ReturnType::InfoTrajectory), "info_trajectory");
    }

    #[test]
    fn history_entry_accepts_null_content() {
        let entry: HistoryEntry =
            serde_json::from_str(r#"{"role":"user","content":null,"agent":"sub"}"#)
                .expect("parse");
        assert_eq!(entry.content, "");
        assert!(entry.is_owned_by("sub"));
        assert!(!entry.is_demo());
    }

    #[test]
    fn info_merge_keeps_existing_fields_not_overwritten() {
        let mut info = Info {
            submission: Some("diff".to_string()),
            ..Info::default()
        };
        let mut extra = Map::new();
        extra.insert("reward".to_string(), Value::from(1));
        info.merge(Info {
            exit_status: Some("submitted".to_string()),
            extra,
            ..Info::default()
        });
        assert_eq!(info.submission.as_deref(), Some("diff"));
        assert_eq!(info.exit_status.as_deref(), Some("submitted"));
        assert_eq!(info.extra.get("reward"), Some(&Value::from(1)));
    }

    #[test]
    fn value_output_becomes_observation() {
        let out = RunOutput::Value(Some("found it".to_string()));
        assert_eq!(out.into_observation().as_deref(), Some("found it"));
    }
}
