//! The observe-decide-act execution loop.
//!
//! One [`Agent`] owns one history and drives a model against a shared
//! [`Environment`]. Each iteration renders a prompt, validates the model's reply,
//! splits the action into dispatch units, and executes them in order until a submit
//! or the environment ends the episode. Subroutine units re-enter this loop through
//! [`crate::subroutine::call_subroutine`] with a fresh `Agent`.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelFlag, is_interrupt};
use crate::core::blocklist::Blocklist;
use crate::core::guard::guard_multiline_input;
use crate::core::history::{demo_entries_for, demonstration_transcript, owned_history};
use crate::core::patterns::{PatternTables, PatternView};
use crate::core::splitter::split_actions;
use crate::core::stats::ApiStats;
use crate::core::template_select::{CodegraphContext, select_template};
use crate::core::types::{
    ExitStatus, HistoryEntry, Info, ReturnType, Role, RunOutput, SplitAction, TrajectoryStep,
};
use crate::hooks::{AgentHook, Hooks};
use crate::io::config::AgentConfig;
use crate::io::environment::{
    Environment, EnvironmentSetupError, SessionIdentity, install_agent_environment,
};
use crate::io::model::{
    ApiRetryExhausted, ContextWindowExceeded, CostLimitExceeded, Model, ModelFactory,
};
use crate::io::prompt::{PromptEngine, PromptVars};
use crate::io::trajectory::{
    TrajectoryRecord, load_checkpoint, load_demonstration, trajectory_path, write_trajectory,
};
use crate::replay::{RecordedTurns, ReplayTarget, ReplayedUnit, replay_checkpoint, replay_exit};
use crate::retry::{Feedback, Requery, Validated, Validator};
use crate::subroutine::{SubroutineError, call_subroutine, replay_subroutine};

/// Arguments for one [`Agent::run`].
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Instance variables for templates (e.g. `issue`).
    pub setup_args: Map<String, Value>,
    /// Observation fed into the first iteration.
    pub observation: Option<String>,
    /// Write `<instance_id>.traj` here after every iteration.
    pub traj_dir: Option<PathBuf>,
    pub return_type: ReturnType,
    /// Counters to continue from; subroutines receive their caller's.
    pub init_model_stats: Option<ApiStats>,
}

/// Inputs threaded from one iteration into the next.
#[derive(Debug, Clone, Default)]
struct IterationInput {
    observation: Option<String>,
    codegraph: Option<CodegraphContext>,
}

/// Result of dispatching one action block.
#[derive(Debug, Default)]
struct DispatchOutcome {
    observation: String,
    done: bool,
    codegraph: Option<CodegraphContext>,
}

/// Per-run bookkeeping persisted after every iteration.
struct RunRecord {
    trajectory: Vec<TrajectoryStep>,
    info: Info,
    path: Option<PathBuf>,
}

pub struct Agent {
    name: String,
    config: AgentConfig,
    model: Box<dyn Model>,
    factory: Rc<dyn ModelFactory>,
    patterns: PatternTables,
    prompts: PromptEngine,
    validator: Validator,
    history: Vec<HistoryEntry>,
    codegraph_history: Vec<CodegraphContext>,
    instance_args: Map<String, Value>,
    last_session: Option<SessionIdentity>,
    hooks: Hooks,
    cancel: CancelFlag,
    depth: usize,
    max_depth: usize,
}

impl Agent {
    /// Build a top-level runtime. The model comes from `factory`, which nested
    /// subroutine runtimes reuse.
    pub fn new(name: &str, config: AgentConfig, factory: Rc<dyn ModelFactory>) -> Result<Self> {
        let max_depth = config.max_subroutine_depth;
        Self::build(name, config, factory, Hooks::new(), CancelFlag::new(), 0, max_depth)
    }

    fn build(
        name: &str,
        config: AgentConfig,
        factory: Rc<dyn ModelFactory>,
        hooks: Hooks,
        cancel: CancelFlag,
        depth: usize,
        max_depth: usize,
    ) -> Result<Self> {
        config
            .validate()
            .with_context(|| format!("invalid config for agent '{name}'"))?;
        let model = factory
            .build(name, &config.model_config())
            .with_context(|| format!("build model for agent '{name}'"))?;
        let patterns = PatternTables::compile(
            &config.commands,
            &config.subroutine_commands(),
            &config.submit_command,
            config.submit_command_end_name.as_deref(),
        )?;
        let blocklist = Blocklist::new(
            config.blocklist.iter().cloned(),
            config.blocklist_standalone.iter().cloned(),
        )
        .with_exempt(&config.submit_command);
        let validator = Validator::for_identity(
            model.identity(),
            config.parse_function,
            blocklist,
            config.command_names(),
        );
        Ok(Self {
            name: name.to_string(),
            config,
            model,
            factory,
            patterns,
            prompts: PromptEngine::new(),
            validator,
            history: Vec::new(),
            codegraph_history: Vec::new(),
            instance_args: Map::new(),
            last_session: None,
            hooks,
            cancel,
            depth,
            max_depth,
        })
    }

    pub fn with_hook(mut self, hook: Rc<dyn AgentHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Full history, including entries spliced in from subroutines.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn codegraph_history(&self) -> &[CodegraphContext] {
        &self.codegraph_history
    }

    pub fn stats(&self) -> &ApiStats {
        self.model.stats()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// A runtime for a subroutine, one level deeper, sharing this runtime's model
    /// factory, hooks, and cancel flag.
    pub(crate) fn nested(&self, name: &str, config: AgentConfig) -> Result<Agent> {
        Self::build(
            name,
            config,
            Rc::clone(&self.factory),
            self.hooks.clone(),
            self.cancel.clone(),
            self.depth + 1,
            self.max_depth,
        )
    }

    pub(crate) fn append_history(&mut self, entry: HistoryEntry) {
        self.hooks.each(|h| h.on_query_message_added(&entry));
        self.history.push(entry);
    }

    /// Splice a finished subroutine's history onto ours. Entries keep their owner.
    pub(crate) fn splice_history(&mut self, entries: &[HistoryEntry]) {
        self.history.extend_from_slice(entries);
    }

    pub(crate) fn replace_stats(&mut self, stats: &ApiStats) {
        self.model.stats_mut().replace(stats);
    }

    fn session_changed(&self, session: &SessionIdentity) -> bool {
        self.last_session.as_ref() != Some(session)
    }

    /// Install variables and command files if the environment's session changed.
    /// A failed setup command is handed back so the caller can end the level with
    /// `exit_error`.
    pub(crate) fn ensure_session(
        &mut self,
        env: &mut dyn Environment,
    ) -> Result<Option<anyhow::Error>> {
        let session = env.session().clone();
        if !self.session_changed(&session) {
            return Ok(None);
        }
        debug!(session = %session.session_id, "session changed");
        match install_agent_environment(env, &self.config) {
            Ok(()) => {
                self.last_session = Some(session);
                Ok(None)
            }
            Err(err) if err.downcast_ref::<EnvironmentSetupError>().is_some() => {
                warn!(error = %err, "environment setup failed");
                Ok(Some(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Run until submit, environment completion, or an exit sentinel.
    #[instrument(skip_all, fields(agent = %self.name, depth = self.depth))]
    pub fn run(&mut self, request: RunRequest, env: &mut dyn Environment) -> Result<RunOutput> {
        self.cancel.check()?;
        let session = env.session().clone();
        let setup_failure = self.ensure_session(env)?;
        self.setup(request.setup_args, request.init_model_stats.as_ref())?;
        self.hooks.each(|h| h.on_run_start());

        let mut record = RunRecord {
            trajectory: Vec::new(),
            info: Info::default(),
            path: request
                .traj_dir
                .as_deref()
                .map(|dir| trajectory_path(dir, &session.instance_id)),
        };
        if let Some(path) = &record.path {
            info!(path = %path.display(), "trajectory will be saved");
        }

        let mut done = false;
        if let Some(checkpoint_path) = self.config.checkpoint_path.clone() {
            let checkpoint = load_checkpoint(&checkpoint_path)?;
            info!(path = %checkpoint_path.display(), steps = checkpoint.trajectory.len(), "replaying checkpoint");
            let outcome = replay_checkpoint(self, checkpoint, env)?;
            record.trajectory = outcome.trajectory;
            record.info.merge(outcome.info);
            record.info.model_stats = Some(self.model.stats().clone());
            done = outcome.done;
            self.persist(&record, &session)?;
        }

        let mut input = IterationInput {
            observation: request.observation,
            codegraph: None,
        };
        let mut pending = setup_failure.map(|err| runtime_exit(&err));
        while !done {
            self.cancel.check()?;
            self.hooks.each(|h| h.on_step_start());
            let state = self.read_state(env)?;
            let turn = match pending.take() {
                Some(turn) => {
                    self.append_history(HistoryEntry::assistant(
                        &turn.output,
                        &turn.thought,
                        &turn.action,
                        &self.name,
                    ));
                    turn
                }
                None => self.forward(&input, state.as_deref())?,
            };
            self.hooks
                .each(|h| h.on_actions_generated(&turn.thought, &turn.action, &turn.output));

            let outcome = self.dispatch(&turn.action, env, &mut record.info)?;
            done = outcome.done;
            input = IterationInput {
                observation: Some(outcome.observation.clone()),
                codegraph: outcome.codegraph,
            };

            let step = TrajectoryStep {
                action: turn.action,
                observation: outcome.observation,
                response: turn.output,
                state,
                thought: turn.thought,
            };
            record.trajectory.push(step);
            record.info.model_stats = Some(self.model.stats().clone());
            self.persist(&record, &session)?;
            if let Some(step) = record.trajectory.last() {
                let stats = self.model.stats();
                self.hooks.each(|h| h.on_step_done(step, stats));
            }
        }

        self.hooks.each(|h| h.on_run_done());
        if let Some(path) = &record.path {
            info!(path = %path.display(), "trajectory saved");
        }
        Ok(match request.return_type {
            ReturnType::Info => RunOutput::Info(record.info),
            ReturnType::InfoTrajectory => RunOutput::InfoTrajectory(record.info, record.trajectory),
            ReturnType::Field(field) => {
                RunOutput::Value(record.trajectory.last().and_then(|step| step.field(field)))
            }
        })
    }

    /// Reset per-run state and push the system message and demonstrations.
    fn setup(
        &mut self,
        instance_args: Map<String, Value>,
        init_stats: Option<&ApiStats>,
    ) -> Result<()> {
        self.model.reset_stats(init_stats);
        self.instance_args = instance_args;
        self.history.clear();
        self.codegraph_history.clear();

        let system_msg =
            self.prompts
                .render("system", &self.config.system_template, &self.system_vars())?;
        info!(agent = %self.name, "SYSTEM\n{system_msg}");
        self.append_history(HistoryEntry::system(system_msg, &self.name));

        if !self.config.use_demonstrations {
            return Ok(());
        }
        for path in self.config.demonstrations.clone() {
            info!(path = %path.display(), "loading demonstration");
            let entries = demo_entries_for(load_demonstration(&path)?, &self.name);
            if self.config.put_demos_in_history {
                if self.config.demonstration_template.is_some() {
                    warn!("demonstration_template is ignored when put_demos_in_history is set");
                }
                for mut entry in entries.into_iter().filter(|e| e.role != Role::System) {
                    entry.is_demo = Some(true);
                    entry.agent = Some(self.name.clone());
                    self.append_history(entry);
                }
            } else {
                let template = self.config.demonstration_template.clone().ok_or_else(|| {
                    anyhow!("demonstrations need demonstration_template or put_demos_in_history")
                })?;
                let mut vars = PromptVars::new();
                vars.set("demonstration", demonstration_transcript(&entries));
                let content = self.prompts.render("demonstration", &template, &vars)?;
                let entry = HistoryEntry {
                    is_demo: Some(true),
                    ..HistoryEntry::user(content, &self.name)
                };
                self.append_history(entry);
            }
        }
        Ok(())
    }

    fn system_vars(&self) -> PromptVars {
        let mut vars = PromptVars::new();
        vars.set("command_docs", self.config.command_docs())
            .extend_strings(&self.config.env_variables);
        vars
    }

    /// Current environment state text, if a state command is configured.
    fn read_state(&self, env: &mut dyn Environment) -> Result<Option<String>> {
        let Some(state) = &self.config.state_command else {
            return Ok(None);
        };
        let output = env
            .communicate(&state.name)
            .with_context(|| format!("run state command '{}'", state.name))?;
        Ok(Some(output))
    }

    fn local_history(&self) -> Vec<HistoryEntry> {
        self.config
            .history_processor
            .apply(owned_history(&self.history, &self.name))
    }

    /// Render this iteration's prompt, query the model, and record the reply.
    fn forward(&mut self, input: &IterationInput, state: Option<&str>) -> Result<Validated> {
        let mut vars = PromptVars::new();
        vars.extend_json(&self.instance_args)
            .extend_json(&self.system_vars().into_map())
            .extend_json(&parse_state(state)?);
        vars.set("observation", input.observation.clone().unwrap_or_default());
        let (search_term, context) = input
            .codegraph
            .as_ref()
            .map(|c| (c.search_term.clone(), c.context.clone()))
            .unwrap_or_default();
        vars.set("search_term", search_term)
            .set("codegraph_context", context);

        let choice = select_template(
            self.history.last(),
            input.observation.as_deref(),
            input.codegraph.as_ref(),
        );
        debug!(?choice, "selected template");
        let message = self.prompts.render_turn(&self.config, choice, &vars)?;
        info!(agent = %self.name, "MODEL INPUT\n{message}");
        self.append_history(HistoryEntry::user(message, &self.name));

        let turn = match self.query_validated() {
            Ok(turn) => turn,
            Err(err) => exit_for_model_error(err)?,
        };
        self.append_history(HistoryEntry::assistant(
            &turn.output,
            &turn.thought,
            &turn.action,
            &self.name,
        ));
        info!(agent = %self.name, "THOUGHT\n{}", turn.thought);
        info!(agent = %self.name, "ACTION\n{}", turn.action);
        Ok(turn)
    }

    fn query_validated(&mut self) -> Result<Validated> {
        let history = self.local_history();
        self.hooks.each(|h| h.on_model_query(&history, &self.name));
        self.cancel.check()?;
        let output = self.model.query(&history)?;
        let mut requery = ModelRequery {
            model: self.model.as_mut(),
            base: &history,
            agent: &self.name,
            prompts: &self.prompts,
            config: &self.config,
            cancel: &self.cancel,
        };
        self.validator.validate(output, &mut requery)
    }

    /// Execute one action block. Dispatch stops at the first unit that ends the
    /// episode.
    fn dispatch(
        &mut self,
        action: &str,
        env: &mut dyn Environment,
        info: &mut Info,
    ) -> Result<DispatchOutcome> {
        if let Some(status) = ExitStatus::from_action(action) {
            return self.dispatch_exit(status, env, info);
        }

        let guarded = guard_multiline_input(action, &self.patterns);
        let units = split_actions(&guarded, &self.patterns, PatternView::Subroutine, &self.name);
        let mut outcome = DispatchOutcome::default();
        let mut observations: Vec<String> = Vec::new();
        for unit in units {
            self.cancel.check()?;
            if self.is_own_unit(&unit) {
                self.hooks.each(|h| h.on_sub_action_started(&unit));
                let observation = match self.retrieval_term(&unit.action) {
                    Some(search_term) => {
                        let context = self.retrieve(&search_term, env)?;
                        outcome.codegraph = Some(CodegraphContext {
                            search_term,
                            context: context.clone(),
                        });
                        context
                    }
                    None => {
                        let result = env.step(&unit.action)?;
                        info.merge(result.info);
                        outcome.done |= result.done;
                        result.observation
                    }
                };
                if unit.cmd_name.as_deref() == Some(self.patterns.submit_command()) {
                    outcome.done = true;
                }
                let done = outcome.done;
                self.hooks
                    .each(|h| h.on_sub_action_executed(Some(&observation), done));
                observations.push(observation);
                if outcome.done {
                    break;
                }
            } else {
                match call_subroutine(self, &unit, env) {
                    Ok(observation) => observations.extend(observation),
                    Err(err) if is_level_error(&err) => {
                        warn!(subroutine = %unit.agent, error = %err, "subroutine failed");
                        let exit = self.dispatch_exit(ExitStatus::Error, env, info)?;
                        observations.push(format!("{err:#}"));
                        observations.extend(Some(exit.observation).filter(|o| !o.is_empty()));
                        outcome.done = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        outcome.observation = observations.join("\n");
        Ok(outcome)
    }

    /// Send an exit sentinel to the environment so it can finalize, then stop.
    fn dispatch_exit(
        &mut self,
        status: ExitStatus,
        env: &mut dyn Environment,
        info: &mut Info,
    ) -> Result<DispatchOutcome> {
        let unit = SplitAction {
            agent: self.name.clone(),
            action: status.as_action().to_string(),
            cmd_name: None,
            args: None,
        };
        self.hooks.each(|h| h.on_sub_action_started(&unit));
        let result = env.step(status.as_action())?;
        info.merge(result.info);
        if info.exit_status.is_none() {
            info.exit_status = Some(status.to_string());
        }
        self.hooks
            .each(|h| h.on_sub_action_executed(Some(&result.observation), true));
        Ok(DispatchOutcome {
            observation: result.observation,
            done: true,
            codegraph: None,
        })
    }

    fn is_own_unit(&self, unit: &SplitAction) -> bool {
        unit.agent == self.name || unit.cmd_name.as_deref() == Some(self.patterns.submit_command())
    }

    /// Search term if `action` invokes the retrieval command.
    fn retrieval_term(&self, action: &str) -> Option<String> {
        let retrieval = self.config.retrieval.as_ref()?;
        let mut tokens = action.split_whitespace();
        if tokens.next()? != retrieval.command {
            return None;
        }
        tokens.next().map(str::to_string)
    }

    fn retrieve(&mut self, search_term: &str, env: &mut dyn Environment) -> Result<String> {
        let retrieval = self
            .config
            .retrieval
            .as_ref()
            .ok_or_else(|| anyhow!("retrieval is not configured"))?;
        let session = env.session();
        let path = retrieval.codegraph_path(&session.instance_id, session.persistent_volume);
        info!(search_term, codegraph_path = %path, "calling retrieval helper");
        let command = retrieval.helper_command(search_term, &path);
        let context = env
            .communicate(&command)
            .with_context(|| format!("retrieve '{search_term}'"))?;
        debug!(search_term, "codegraph context\n{context}");
        self.codegraph_history.push(CodegraphContext {
            search_term: search_term.to_string(),
            context: context.clone(),
        });
        Ok(context)
    }

    fn persist(&self, record: &RunRecord, session: &SessionIdentity) -> Result<()> {
        let Some(path) = &record.path else {
            return Ok(());
        };
        write_trajectory(
            path,
            &TrajectoryRecord {
                environment: &session.name,
                trajectory: &record.trajectory,
                history: &self.history,
                codegraph: &self.codegraph_history,
                info: &record.info,
            },
        )
    }
}

impl ReplayTarget for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    fn patterns(&self) -> &PatternTables {
        &self.patterns
    }

    fn restore(&mut self, history: Vec<HistoryEntry>, stats: &ApiStats) {
        self.history = history;
        self.model.stats_mut().replace(stats);
    }

    fn replay_unit(
        &mut self,
        unit: &SplitAction,
        env: &mut dyn Environment,
        turns: &mut RecordedTurns,
    ) -> Result<ReplayedUnit> {
        self.cancel.check()?;
        if !self.is_own_unit(unit) {
            return match replay_subroutine(self, unit, env, turns) {
                Ok(()) => Ok(ReplayedUnit::default()),
                Err(err) if is_level_error(&err) => {
                    warn!(subroutine = %unit.agent, error = %err, "replayed subroutine failed");
                    replay_exit(ExitStatus::Error, env)
                }
                Err(err) => Err(err),
            };
        }
        // Retrieval is read-only; its result already lives in the restored history.
        if self.retrieval_term(&unit.action).is_some() {
            return Ok(ReplayedUnit::default());
        }
        let result = env.step(&unit.action)?;
        let submitted = unit.cmd_name.as_deref() == Some(self.patterns.submit_command());
        Ok(ReplayedUnit {
            done: result.done || submitted,
            info: result.info,
        })
    }
}

/// Re-asks the model on a temporary history: the owned history, the rejected
/// output, and the error message. Nothing here reaches the persisted history.
struct ModelRequery<'a> {
    model: &'a mut dyn Model,
    base: &'a [HistoryEntry],
    agent: &'a str,
    prompts: &'a PromptEngine,
    config: &'a AgentConfig,
    cancel: &'a CancelFlag,
}

impl Requery for ModelRequery<'_> {
    fn requery(&mut self, rejected_output: &str, feedback: Feedback<'_>) -> Result<String> {
        self.cancel.check()?;
        let mut vars = PromptVars::new();
        let message = match feedback {
            Feedback::Format(err) => {
                vars.set("error", err.message.clone());
                self.prompts
                    .render("format_error", &self.config.format_error_template, &vars)?
            }
            Feedback::Blocked { name } => {
                vars.set("name", name);
                self.prompts
                    .render("blocklist_error", &self.config.blocklist_error_template, &vars)?
            }
        };
        warn!(agent = self.agent, "requerying model\n{message}");
        let mut history = self.base.to_vec();
        history.push(HistoryEntry {
            thought: None,
            action: None,
            ..HistoryEntry::assistant(rejected_output, "", "", self.agent)
        });
        history.push(HistoryEntry::user(message, self.agent));
        self.model.query(&history)
    }
}

/// Parse state command output into template variables.
fn parse_state(state: Option<&str>) -> Result<Map<String, Value>> {
    match state.map(str::trim) {
        None | Some("") => Ok(Map::new()),
        Some(text) => serde_json::from_str(text).context("state command must print a JSON object"),
    }
}

/// Map a failed model query to its exit sentinel. Interrupts are returned as errors.
fn exit_for_model_error(err: anyhow::Error) -> Result<Validated> {
    if is_interrupt(&err) {
        return Err(err);
    }
    let (thought, action, output) = if err.downcast_ref::<ContextWindowExceeded>().is_some() {
        warn!("context window exceeded");
        let msg = "Exit due to context window".to_string();
        (msg.clone(), ExitStatus::Context, msg)
    } else if err.downcast_ref::<CostLimitExceeded>().is_some() {
        warn!("cost limit exceeded");
        let msg = "Exit due to cost limit".to_string();
        (msg.clone(), ExitStatus::Cost, msg)
    } else if let Some(retry) = err.downcast_ref::<ApiRetryExhausted>() {
        warn!(error = %retry, "retry error");
        (
            format!("Exit due to retry error: {retry}"),
            ExitStatus::Api,
            format!("exit due to retry error: {retry}"),
        )
    } else {
        return Ok(runtime_exit(&err));
    };
    Ok(Validated {
        thought,
        action: action.as_action().to_string(),
        output,
    })
}

fn runtime_exit(err: &anyhow::Error) -> Validated {
    warn!(error = %err, "runtime error");
    Validated {
        thought: format!("Exit due to runtime error: {err:#}"),
        action: ExitStatus::Error.as_action().to_string(),
        output: format!("exit due to runtime error: {err:#}"),
    }
}

/// Errors that end the current runtime level with `exit_error`.
fn is_level_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SubroutineError>().is_some()
        || err.downcast_ref::<EnvironmentSetupError>().is_some()
}
