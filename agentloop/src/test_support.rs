//! Test-only scripted collaborators: models, environments, hooks, and configs.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use anyhow::{Result, anyhow};

use crate::cancel::Interrupted;
use crate::core::commands::CommandSpec;
use crate::core::stats::ApiStats;
use crate::core::types::{HistoryEntry, Info, ReturnType, SplitAction, TrajectoryStep};
use crate::hooks::AgentHook;
use crate::io::config::{AgentConfig, ModelConfig, SubroutineSpec};
use crate::io::environment::{CommandFile, Environment, SessionIdentity, StepResult};
use crate::io::model::{
    ApiRetryExhausted, ContextWindowExceeded, CostLimitExceeded, Model, ModelFactory,
    ModelIdentity,
};

/// Cost charged by a scripted model for every successful query.
pub const SCRIPTED_QUERY_COST: f64 = 0.25;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    Cost,
    Context,
    Retry,
    Runtime(String),
    Interrupt,
}

impl Reply {
    fn into_result(self) -> Result<String> {
        match self {
            Reply::Output(text) => Ok(text),
            Reply::Cost => Err(CostLimitExceeded {
                cost: 3.0,
                limit: 2.0,
            }
            .into()),
            Reply::Context => Err(ContextWindowExceeded {
                tokens: 9000,
                window: 8000,
            }
            .into()),
            Reply::Retry => Err(ApiRetryExhausted {
                attempts: 3,
                message: "503 Service Unavailable".to_string(),
            }
            .into()),
            Reply::Runtime(message) => Err(anyhow!(message)),
            Reply::Interrupt => Err(Interrupted.into()),
        }
    }
}

/// `thought` followed by a fenced `action` block, as the default parser expects.
pub fn turn(thought: &str, action: &str) -> Reply {
    Reply::Output(format!("{thought}\n```\n{action}\n```"))
}

/// A query seen by a scripted model.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub agent: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Default)]
struct ScriptState {
    replies: BTreeMap<String, VecDeque<Reply>>,
    queries: Vec<RecordedQuery>,
}

/// Serves scripted replies per agent name. Models built from one factory share the
/// script, so nested agents read their own queue.
#[derive(Clone)]
pub struct ScriptedModelFactory {
    identity: ModelIdentity,
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedModelFactory {
    pub fn new(replies: Vec<(&str, Reply)>) -> Self {
        let mut state = ScriptState::default();
        for (agent, reply) in replies {
            state
                .replies
                .entry(agent.to_string())
                .or_default()
                .push_back(reply);
        }
        Self {
            identity: ModelIdentity::Api,
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn with_identity(mut self, identity: ModelIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.state.borrow().queries.clone()
    }

    pub fn remaining(&self, agent: &str) -> usize {
        self.state
            .borrow()
            .replies
            .get(agent)
            .map_or(0, VecDeque::len)
    }
}

impl ModelFactory for ScriptedModelFactory {
    fn build(&self, agent: &str, _config: &ModelConfig) -> Result<Box<dyn Model>> {
        Ok(Box::new(ScriptedModel {
            agent: agent.to_string(),
            identity: self.identity,
            state: Rc::clone(&self.state),
            stats: ApiStats::default(),
        }))
    }
}

struct ScriptedModel {
    agent: String,
    identity: ModelIdentity,
    state: Rc<RefCell<ScriptState>>,
    stats: ApiStats,
}

impl Model for ScriptedModel {
    fn identity(&self) -> ModelIdentity {
        self.identity
    }

    fn query(&mut self, history: &[HistoryEntry]) -> Result<String> {
        let reply = {
            let mut state = self.state.borrow_mut();
            state.queries.push(RecordedQuery {
                agent: self.agent.clone(),
                history: history.to_vec(),
            });
            state
                .replies
                .get_mut(&self.agent)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| anyhow!("no scripted reply left for agent '{}'", self.agent))?
        };
        let output = reply.into_result()?;
        self.stats.record(10, 5, SCRIPTED_QUERY_COST);
        Ok(output)
    }

    fn reset_stats(&mut self, initial: Option<&ApiStats>) {
        self.stats = initial.cloned().unwrap_or_default();
    }

    fn stats(&self) -> &ApiStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut ApiStats {
        &mut self.stats
    }
}

/// One call the scripted environment received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvCall {
    Communicate(String),
    Step(String),
    AddCommands(Vec<String>),
}

#[derive(Debug, Clone)]
struct ScriptedStep {
    result: StepResult,
    returncode: i32,
}

/// In-memory environment. Unscripted `step` calls echo `ran <action>`; `submit`
/// ends the episode with a submission.
pub struct ScriptedEnv {
    session: SessionIdentity,
    calls: Vec<EnvCall>,
    communicate: BTreeMap<String, VecDeque<(String, i32)>>,
    steps: BTreeMap<String, VecDeque<ScriptedStep>>,
    returncode: i32,
}

impl Default for ScriptedEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEnv {
    pub fn new() -> Self {
        Self {
            session: SessionIdentity {
                session_id: "session-1".to_string(),
                instance_id: "inst-1".to_string(),
                name: "scripted".to_string(),
                persistent_volume: false,
            },
            calls: Vec::new(),
            communicate: BTreeMap::new(),
            steps: BTreeMap::new(),
            returncode: 0,
        }
    }

    /// Script the next `communicate(command)`.
    pub fn on_communicate(mut self, command: &str, output: &str, returncode: i32) -> Self {
        self.communicate
            .entry(command.to_string())
            .or_default()
            .push_back((output.to_string(), returncode));
        self
    }

    /// Script the next `step(action)`; `action` is compared trimmed.
    pub fn on_step(mut self, action: &str, result: StepResult, returncode: i32) -> Self {
        self.steps
            .entry(action.trim().to_string())
            .or_default()
            .push_back(ScriptedStep { result, returncode });
        self
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.session.session_id = session_id.to_string();
    }

    pub fn calls(&self) -> &[EnvCall] {
        &self.calls
    }

    pub fn steps(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EnvCall::Step(action) => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn communications(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                EnvCall::Communicate(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Environment for ScriptedEnv {
    fn communicate(&mut self, command: &str) -> Result<String> {
        self.calls.push(EnvCall::Communicate(command.to_string()));
        let scripted = self
            .communicate
            .get_mut(command)
            .and_then(VecDeque::pop_front);
        let (output, returncode) = match scripted {
            Some(reply) => reply,
            None if command == "pwd -P" => ("/repo\n".to_string(), 0),
            None => (String::new(), 0),
        };
        self.returncode = returncode;
        Ok(output)
    }

    fn returncode(&self) -> i32 {
        self.returncode
    }

    fn step(&mut self, action: &str) -> Result<StepResult> {
        self.calls.push(EnvCall::Step(action.to_string()));
        let key = action.trim();
        if let Some(scripted) = self.steps.get_mut(key).and_then(VecDeque::pop_front) {
            self.returncode = scripted.returncode;
            return Ok(scripted.result);
        }
        self.returncode = 0;
        if key == "submit" {
            return Ok(StepResult {
                observation: String::new(),
                reward: None,
                done: true,
                info: Info {
                    exit_status: Some("submitted".to_string()),
                    submission: Some("diff --git a/x b/x".to_string()),
                    ..Info::default()
                },
            });
        }
        Ok(StepResult {
            observation: format!("ran {key}"),
            ..StepResult::default()
        })
    }

    fn add_commands(&mut self, files: &[CommandFile]) -> Result<()> {
        self.calls.push(EnvCall::AddCommands(
            files.iter().map(|f| f.name.clone()).collect(),
        ));
        Ok(())
    }

    fn session(&self) -> &SessionIdentity {
        &self.session
    }
}

/// Hook that records every callback as a short string.
#[derive(Default)]
pub struct RecordingHook {
    events: RefCell<Vec<String>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl AgentHook for RecordingHook {
    fn on_init(&self) {
        self.push("init".to_string());
    }

    fn on_run_start(&self) {
        self.push("run_start".to_string());
    }

    fn on_step_start(&self) {
        self.push("step_start".to_string());
    }

    fn on_model_query(&self, _history: &[HistoryEntry], agent: &str) {
        self.push(format!("model_query:{agent}"));
    }

    fn on_actions_generated(&self, _thought: &str, action: &str, _output: &str) {
        self.push(format!("actions:{}", action.trim()));
    }

    fn on_sub_action_started(&self, sub_action: &SplitAction) {
        self.push(format!("sub_action:{}", sub_action.action.trim()));
    }

    fn on_sub_action_executed(&self, _observation: Option<&str>, done: bool) {
        self.push(format!("executed:{done}"));
    }

    fn on_step_done(&self, _step: &TrajectoryStep, _stats: &ApiStats) {
        self.push("step_done".to_string());
    }

    fn on_run_done(&self) {
        self.push("run_done".to_string());
    }
}

/// A primary agent config with `open`, a block `edit ... end_of_edit`, and submit.
pub fn agent_config() -> AgentConfig {
    AgentConfig {
        system_template: "SYSTEM\n{{ command_docs }}".to_string(),
        instance_template: "ISSUE: {{ issue }}".to_string(),
        next_step_template: "OBSERVATION: {{ observation }}".to_string(),
        next_step_no_output_template: "NO OUTPUT".to_string(),
        next_step_codegraph_template: "CODEGRAPH {{ search_term }}: {{ codegraph_context }}"
            .to_string(),
        format_error_template: "FORMAT ERROR".to_string(),
        blocklist_error_template: "BLOCKED {{ name }}".to_string(),
        commands: vec![
            CommandSpec::single_line("open"),
            CommandSpec::block("edit", "end_of_edit"),
        ],
        blocklist: vec!["vim".to_string()],
        ..AgentConfig::default()
    }
}

/// Add a subroutine that runs `agent` as a nested runtime.
pub fn with_subroutine(
    mut config: AgentConfig,
    name: &str,
    agent: AgentConfig,
    init_observation: Option<&str>,
    return_type: ReturnType,
) -> AgentConfig {
    config.subroutines.push(SubroutineSpec {
        command: CommandSpec::single_line(name),
        init_observation: init_observation.map(str::to_string),
        return_type,
        agent_config: None,
        agent: Some(Box::new(agent)),
    });
    config
}
