//! Model client seam and the bundled model implementations.
//!
//! The loop talks to models only through [`Model`]. Distinguished failures are small
//! error structs so the loop can recover them with `downcast_ref` and turn them into
//! exit sentinels.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::cancel::Interrupted;
use crate::core::stats::ApiStats;
use crate::core::types::HistoryEntry;
use crate::io::config::ModelConfig;

/// How the retry validator treats this model's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelIdentity {
    /// Output is the action verbatim.
    Human,
    /// Output is parsed once, without retries or blocklist checks.
    HumanThought,
    /// Output is parsed and validated with bounded requery.
    Api,
}

impl ModelIdentity {
    pub fn from_name(name: &str) -> Self {
        match name {
            "human" => ModelIdentity::Human,
            "human_thought" => ModelIdentity::HumanThought,
            _ => ModelIdentity::Api,
        }
    }
}

/// A language model client with usage accounting.
pub trait Model {
    fn identity(&self) -> ModelIdentity;

    /// Query with an owner-scoped history. Usage is charged to [`Model::stats`].
    fn query(&mut self, history: &[HistoryEntry]) -> Result<String>;

    /// Reset counters, optionally continuing from a caller's counters.
    fn reset_stats(&mut self, initial: Option<&ApiStats>);

    fn stats(&self) -> &ApiStats;

    fn stats_mut(&mut self) -> &mut ApiStats;
}

/// Builds a model for a named agent. Subroutine runtimes build theirs through the same
/// factory as their caller.
pub trait ModelFactory {
    fn build(&self, agent: &str, config: &ModelConfig) -> Result<Box<dyn Model>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostLimitExceeded {
    pub cost: f64,
    pub limit: f64,
}

impl fmt::Display for CostLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cost {:.4} exceeds limit {:.4}", self.cost, self.limit)
    }
}

impl std::error::Error for CostLimitExceeded {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindowExceeded {
    pub tokens: u64,
    pub window: u64,
}

impl fmt::Display for ContextWindowExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input of {} tokens exceeds context window of {}",
            self.tokens, self.window
        )
    }
}

impl std::error::Error for ContextWindowExceeded {}

/// Transient API failures outlasted the client's retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRetryExhausted {
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for ApiRetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.message)
    }
}

impl std::error::Error for ApiRetryExhausted {}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Charge one query to `stats` and enforce the configured limits.
///
/// The context window is checked before charging; cost limits after, so the query
/// that crosses a limit is still counted.
pub fn charge_query(
    stats: &mut ApiStats,
    config: &ModelConfig,
    history: &[HistoryEntry],
    output: &str,
) -> Result<()> {
    let sent: u64 = history.iter().map(|e| estimate_tokens(&e.content)).sum();
    if config.context_window > 0 && sent > config.context_window {
        return Err(ContextWindowExceeded {
            tokens: sent,
            window: config.context_window,
        }
        .into());
    }
    let received = estimate_tokens(output);
    let cost = sent as f64 / 1000.0 * config.cost_per_1k_input_tokens
        + received as f64 / 1000.0 * config.cost_per_1k_output_tokens;
    stats.record(sent, received, cost);
    debug!(sent, received, cost, "charged model query");

    if config.per_instance_cost_limit > 0.0 && stats.instance_cost >= config.per_instance_cost_limit {
        return Err(CostLimitExceeded {
            cost: stats.instance_cost,
            limit: config.per_instance_cost_limit,
        }
        .into());
    }
    if config.total_cost_limit > 0.0 && stats.total_cost >= config.total_cost_limit {
        return Err(CostLimitExceeded {
            cost: stats.total_cost,
            limit: config.total_cost_limit,
        }
        .into());
    }
    Ok(())
}

/// Recorded model outputs keyed by agent name, consumed in order.
#[derive(Debug, Default)]
pub struct ReplaySource {
    queues: BTreeMap<String, VecDeque<String>>,
}

impl ReplaySource {
    /// Load a JSON object mapping agent names to arrays of outputs.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let queues: BTreeMap<String, VecDeque<String>> = serde_json::from_str(&contents)
            .with_context(|| format!("parse replay file {}", path.display()))?;
        Ok(Self { queues })
    }

    pub fn next_output(&mut self, agent: &str) -> Result<String> {
        self.queues
            .get_mut(agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("replay outputs for agent '{agent}' are exhausted"))
    }
}

/// Serves recorded outputs with deterministic usage accounting.
pub struct ReplayModel {
    agent: String,
    config: ModelConfig,
    source: Rc<RefCell<ReplaySource>>,
    stats: ApiStats,
}

impl Model for ReplayModel {
    fn identity(&self) -> ModelIdentity {
        ModelIdentity::Api
    }

    fn query(&mut self, history: &[HistoryEntry]) -> Result<String> {
        let output = self.source.borrow_mut().next_output(&self.agent)?;
        charge_query(&mut self.stats, &self.config, history, &output)?;
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

/// Reads the model's turns from an interactive operator.
///
/// The latest message is echoed to `output`; the reply is every line up to a line
/// holding only `.`. End of input interrupts the run.
pub struct HumanModel {
    identity: ModelIdentity,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
    stats: ApiStats,
}

impl HumanModel {
    pub fn new(identity: ModelIdentity, input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        Self {
            identity,
            input,
            output,
            stats: ApiStats::default(),
        }
    }

    pub fn stdio(identity: ModelIdentity) -> Self {
        Self::new(
            identity,
            Box::new(std::io::BufReader::new(std::io::stdin())),
            Box::new(std::io::stderr()),
        )
    }
}

impl Model for HumanModel {
    fn identity(&self) -> ModelIdentity {
        self.identity
    }

    fn query(&mut self, history: &[HistoryEntry]) -> Result<String> {
        if let Some(last) = history.last() {
            writeln!(self.output, "{}", last.content).context("write prompt")?;
        }
        write!(self.output, "> ").context("write prompt")?;
        self.output.flush().context("flush prompt")?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.input.read_line(&mut line).context("read reply")?;
            if read == 0 {
                if lines.is_empty() {
                    return Err(Interrupted.into());
                }
                break;
            }
            if line.trim_end_matches(['\r', '\n']) == "." {
                break;
            }
            lines.push(line);
        }
        self.stats.api_calls += 1;
        Ok(lines.concat().trim_end_matches('\n').to_string())
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

/// Picks a model by configured name: `human`, `human_thought`, or replay.
///
/// Replay files are loaded once per path and shared by every agent that names them,
/// so nested agents draw from the same recording as their caller.
#[derive(Default)]
pub struct ConfiguredModelFactory {
    replay_override: Option<PathBuf>,
    sources: RefCell<BTreeMap<PathBuf, Rc<RefCell<ReplaySource>>>>,
}

impl ConfiguredModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `path` for every replay model regardless of config.
    pub fn with_replay_override(mut self, path: PathBuf) -> Self {
        self.replay_override = Some(path);
        self
    }

    fn source(&self, path: &Path) -> Result<Rc<RefCell<ReplaySource>>> {
        let mut sources = self.sources.borrow_mut();
        if let Some(source) = sources.get(path) {
            return Ok(Rc::clone(source));
        }
        let source = Rc::new(RefCell::new(ReplaySource::load(path)?));
        sources.insert(path.to_path_buf(), Rc::clone(&source));
        Ok(source)
    }
}

impl ModelFactory for ConfiguredModelFactory {
    fn build(&self, agent: &str, config: &ModelConfig) -> Result<Box<dyn Model>> {
        match ModelIdentity::from_name(&config.name) {
            identity @ (ModelIdentity::Human | ModelIdentity::HumanThought) => {
                Ok(Box::new(HumanModel::stdio(identity)))
            }
            ModelIdentity::Api => {
                let path = self
                    .replay_override
                    .as_ref()
                    .or(config.replay_path.as_ref())
                    .ok_or_else(|| {
                        anyhow!(
                            "model '{}' for agent '{agent}' needs a replay_path",
                            config.name
                        )
                    })?;
                if config.name != "replay" {
                    warn!(model = %config.name, "no API client bundled, serving replay outputs");
                }
                Ok(Box::new(ReplayModel {
                    agent: agent.to_string(),
                    config: config.clone(),
                    source: self.source(path)?,
                    stats: ApiStats::default(),
                }))
            }
        }
    }
}
