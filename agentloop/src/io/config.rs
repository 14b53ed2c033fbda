//! Agent configuration loaded from TOML.
//!
//! A config file describes one agent: its templates, command table, subroutines, and
//! model settings. Subroutines carry a nested agent config, either inline or as a path
//! to another TOML file resolved relative to the parent file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::commands::{CommandSpec, render_command_docs};
use crate::core::history::HistoryProcessor;
use crate::core::parsing::OutputParser;
use crate::core::types::ReturnType;
use crate::io::environment::shell_quote;

/// One agent's configuration (TOML).
///
/// Templates use minijinja syntax. Rendering is strict: a template referencing a
/// variable that is not supplied fails the run instead of rendering empty text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub system_template: String,
    pub instance_template: String,
    pub next_step_template: String,
    pub next_step_no_output_template: String,
    pub next_step_codegraph_template: String,
    pub strategy_template: Option<String>,
    pub demonstration_template: Option<String>,
    pub format_error_template: String,
    pub blocklist_error_template: String,

    pub commands: Vec<CommandSpec>,
    pub subroutines: Vec<SubroutineSpec>,
    pub submit_command: String,
    pub submit_command_end_name: Option<String>,

    /// Defines a shell function at setup; its name is run every iteration and must
    /// print a JSON object.
    pub state_command: Option<StateCommand>,
    pub env_variables: BTreeMap<String, String>,
    pub command_files: Vec<PathBuf>,

    pub parse_function: OutputParser,
    pub history_processor: HistoryProcessor,
    pub blocklist: Vec<String>,
    pub blocklist_standalone: Vec<String>,

    pub demonstrations: Vec<PathBuf>,
    pub use_demonstrations: bool,
    pub put_demos_in_history: bool,

    pub checkpoint_path: Option<PathBuf>,
    pub retrieval: Option<RetrievalConfig>,
    pub max_subroutine_depth: usize,

    /// Model settings. A subroutine without its own `model` table inherits its
    /// parent's at load time.
    pub model: Option<ModelConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: "You are an autonomous programmer working in a shell.\n\nCOMMANDS:\n{{ command_docs }}".to_string(),
            instance_template: "{{ issue }}".to_string(),
            next_step_template: "{{ observation }}".to_string(),
            next_step_no_output_template: "Your command ran successfully and did not produce any output.".to_string(),
            next_step_codegraph_template: "Results for `{{ search_term }}`:\n{{ codegraph_context }}".to_string(),
            strategy_template: None,
            demonstration_template: None,
            format_error_template: "Your output was not formatted correctly. Reply with a discussion followed by exactly one command block.".to_string(),
            blocklist_error_template: "Interactive operation '{{ name }}' is not supported by this environment.".to_string(),
            commands: Vec::new(),
            subroutines: Vec::new(),
            submit_command: "submit".to_string(),
            submit_command_end_name: None,
            state_command: None,
            env_variables: BTreeMap::new(),
            command_files: Vec::new(),
            parse_function: OutputParser::default(),
            history_processor: HistoryProcessor::default(),
            blocklist: Vec::new(),
            blocklist_standalone: Vec::new(),
            demonstrations: Vec::new(),
            use_demonstrations: false,
            put_demos_in_history: false,
            checkpoint_path: None,
            retrieval: None,
            max_subroutine_depth: 8,
            model: None,
        }
    }
}

/// A delegated agent the model may call by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubroutineSpec {
    #[serde(flatten)]
    pub command: CommandSpec,
    /// Run through the environment before the nested agent starts. `{args}` is
    /// replaced with the call's arguments.
    #[serde(default)]
    pub init_observation: Option<String>,
    #[serde(default)]
    pub return_type: ReturnType,
    #[serde(default)]
    pub agent_config: Option<PathBuf>,
    #[serde(default)]
    pub agent: Option<Box<AgentConfig>>,
}

impl SubroutineSpec {
    pub fn name(&self) -> &str {
        &self.command.name
    }

    /// The nested agent config. Always present after [`load_config`].
    pub fn agent(&self) -> Result<&AgentConfig> {
        self.agent
            .as_deref()
            .ok_or_else(|| anyhow!("subroutine '{}' has no agent config", self.name()))
    }

    /// The init observation with `{args}` substituted.
    pub fn init_observation_for(&self, args: &str) -> Option<String> {
        self.init_observation
            .as_deref()
            .map(|template| template.replace("{args}", args))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateCommand {
    pub name: String,
    #[serde(default)]
    pub code: String,
}

/// The codegraph lookup command.
///
/// An action whose leading token is `command` is not sent to `step`; instead `helper`
/// runs through `communicate` with the search term and the instance's graph directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub command: String,
    pub helper: String,
    pub persistent_root: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            command: "search_repo".to_string(),
            helper: "python /root/retrieve_graph.py".to_string(),
            persistent_root: "/root/persistent_data".to_string(),
        }
    }
}

impl RetrievalConfig {
    /// Graph directory for an instance.
    pub fn codegraph_path(&self, instance_id: &str, persistent_volume: bool) -> String {
        let base = if persistent_volume {
            self.persistent_root.trim_end_matches('/')
        } else {
            ""
        };
        format!("{base}/{instance_id}")
    }

    /// The helper invocation for one search term. Both arguments are shell-quoted.
    pub fn helper_command(&self, search_term: &str, codegraph_path: &str) -> String {
        format!(
            "{} --search_term {} --codegraph_dir {}",
            self.helper,
            shell_quote(search_term),
            shell_quote(codegraph_path)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// `human`, `human_thought`, or any other name for a scripted/API model.
    pub name: String,
    pub replay_path: Option<PathBuf>,
    /// Zero disables the limit.
    pub per_instance_cost_limit: f64,
    /// Zero disables the limit.
    pub total_cost_limit: f64,
    pub cost_per_1k_input_tokens: f64,
    pub cost_per_1k_output_tokens: f64,
    /// Zero disables the check.
    pub context_window: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "replay".to_string(),
            replay_path: None,
            per_instance_cost_limit: 0.0,
            total_cost_limit: 0.0,
            cost_per_1k_input_tokens: 0.0,
            cost_per_1k_output_tokens: 0.0,
            context_window: 0,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.submit_command.trim().is_empty() {
            return Err(anyhow!("submit_command must not be empty"));
        }
        if self.max_subroutine_depth == 0 {
            return Err(anyhow!("max_subroutine_depth must be > 0"));
        }

        let mut command_names = BTreeSet::new();
        for command in &self.commands {
            if command.name.trim().is_empty() {
                return Err(anyhow!("command names must not be empty"));
            }
            if !command_names.insert(command.name.as_str()) {
                return Err(anyhow!("duplicate command '{}'", command.name));
            }
        }
        let mut subroutine_names = BTreeSet::new();
        for sub in &self.subroutines {
            let name = sub.name();
            if name.trim().is_empty() {
                return Err(anyhow!("subroutine names must not be empty"));
            }
            if command_names.contains(name) {
                return Err(anyhow!("subroutine '{name}' is named like a command"));
            }
            if !subroutine_names.insert(name) {
                return Err(anyhow!("duplicate subroutine '{name}'"));
            }
            if sub.agent.is_some() && sub.agent_config.is_some() {
                return Err(anyhow!(
                    "subroutine '{name}' sets both an inline agent and agent_config"
                ));
            }
        }

        if self.use_demonstrations
            && !self.demonstrations.is_empty()
            && self.demonstration_template.is_none()
            && !self.put_demos_in_history
        {
            return Err(anyhow!(
                "demonstrations require demonstration_template or put_demos_in_history"
            ));
        }
        if let Some(state) = &self.state_command
            && state.name.trim().is_empty()
        {
            return Err(anyhow!("state_command.name must not be empty"));
        }
        if let Some(retrieval) = &self.retrieval
            && retrieval.command.trim().is_empty()
        {
            return Err(anyhow!("retrieval.command must not be empty"));
        }
        Ok(())
    }

    pub fn model_config(&self) -> ModelConfig {
        self.model.clone().unwrap_or_default()
    }

    /// Command names the `action` parser accepts: commands plus subroutines.
    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.name.clone())
            .chain(self.subroutines.iter().map(|s| s.name().to_string()))
            .collect()
    }

    pub fn subroutine_commands(&self) -> Vec<CommandSpec> {
        self.subroutines.iter().map(|s| s.command.clone()).collect()
    }

    pub fn subroutine(&self, name: &str) -> Option<&SubroutineSpec> {
        self.subroutines.iter().find(|s| s.name() == name)
    }

    /// Docs for the system message: commands, then subroutines.
    pub fn command_docs(&self) -> String {
        render_command_docs(
            self.commands
                .iter()
                .chain(self.subroutines.iter().map(|s| &s.command)),
        )
    }
}

/// Load, resolve, and validate a config file and every nested subroutine config.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let mut stack = Vec::new();
    load_config_inner(path, &mut stack, None)
}

/// Parse a config from a string. Relative paths resolve against `base_dir`.
pub fn parse_config(contents: &str, base_dir: &Path) -> Result<AgentConfig> {
    let mut cfg: AgentConfig = toml::from_str(contents).context("parse agent config")?;
    let mut stack = Vec::new();
    resolve(&mut cfg, base_dir, &mut stack, None)?;
    Ok(cfg)
}

fn load_config_inner(
    path: &Path,
    stack: &mut Vec<PathBuf>,
    parent_model: Option<&ModelConfig>,
) -> Result<AgentConfig> {
    let canonical = fs::canonicalize(path).with_context(|| format!("resolve {}", path.display()))?;
    if stack.contains(&canonical) {
        bail!("subroutine config cycle through {}", path.display());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let base_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    stack.push(canonical);
    let resolved = resolve(&mut cfg, &base_dir, stack, parent_model)
        .with_context(|| format!("load {}", path.display()));
    stack.pop();
    resolved?;
    Ok(cfg)
}

fn resolve(
    cfg: &mut AgentConfig,
    base_dir: &Path,
    stack: &mut Vec<PathBuf>,
    parent_model: Option<&ModelConfig>,
) -> Result<()> {
    if cfg.model.is_none() {
        cfg.model = parent_model.cloned();
    }
    if let Some(model) = cfg.model.as_mut() {
        relative_to(base_dir, &mut model.replay_path);
    }
    for file in &mut cfg.command_files {
        *file = base_dir.join(&*file);
    }
    for demo in &mut cfg.demonstrations {
        *demo = base_dir.join(&*demo);
    }
    relative_to(base_dir, &mut cfg.checkpoint_path);
    cfg.validate()?;

    let model = cfg.model.clone();
    for sub in &mut cfg.subroutines {
        let nested = match (sub.agent.take(), &sub.agent_config) {
            (Some(mut inline), _) => {
                resolve(&mut inline, base_dir, stack, model.as_ref())
                    .with_context(|| format!("subroutine '{}'", sub.command.name))?;
                inline
            }
            (None, Some(path)) => {
                let nested_path = base_dir.join(path);
                Box::new(load_config_inner(&nested_path, stack, model.as_ref())?)
            }
            (None, None) => {
                let mut inline = Box::<AgentConfig>::default();
                resolve(&mut inline, base_dir, stack, model.as_ref())?;
                inline
            }
        };
        sub.agent = Some(nested);
    }
    Ok(())
}

fn relative_to(base_dir: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path.as_mut() {
        *p = base_dir.join(&*p);
    }
}
