//! Execution environment seam.
//!
//! The [`Environment`] trait decouples the loop from the sandbox that actually runs
//! shell text. The bundled implementation is [`crate::io::shell::LocalShellEnv`];
//! tests use a scripted environment that records every call.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Info;
use crate::io::config::{AgentConfig, StateCommand};

/// Identity of the session an environment is attached to. A change in any field
/// means variables and command files must be installed again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub persistent_volume: bool,
}

/// Outcome of [`Environment::step`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepResult {
    pub observation: String,
    pub reward: Option<f64>,
    pub done: bool,
    pub info: Info,
}

/// Sandbox that runs shell text on the agent's behalf.
pub trait Environment {
    /// Run `command` and return its output. The exit code is read back through
    /// [`Environment::returncode`].
    fn communicate(&mut self, command: &str) -> Result<String>;

    /// Exit code of the last `communicate` or `step`.
    fn returncode(&self) -> i32;

    /// Run one agent action. Exit sentinels are passed here too so the environment
    /// can finalize the episode.
    fn step(&mut self, action: &str) -> Result<StepResult>;

    fn available_actions(&self) -> Vec<String> {
        Vec::new()
    }

    fn add_commands(&mut self, files: &[CommandFile]) -> Result<()>;

    fn session(&self) -> &SessionIdentity;
}

/// How a command file is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFileKind {
    /// Executable placed on `PATH`.
    Script,
    /// Sourced into the shell.
    SourceFile,
    /// Copied next to the scripts but neither executed nor sourced.
    Utility,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFile {
    pub name: String,
    pub contents: String,
    #[serde(rename = "type")]
    pub kind: CommandFileKind,
}

impl CommandFile {
    /// Classify a file by its shebang and name.
    ///
    /// Files with `#!` become scripts named after their stem (leading `_` stripped).
    /// Otherwise `*.sh` files are sourced and `_*` files are utilities; anything else
    /// is a configuration error.
    pub fn classify(path: &Path, contents: String) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("command file {} has no usable name", path.display()))?;

        if contents.trim_start().starts_with("#!") {
            let stem = file_name
                .rsplit_once('.')
                .map_or(file_name, |(stem, _)| stem)
                .trim_start_matches('_');
            return Ok(Self {
                name: stem.to_string(),
                contents,
                kind: CommandFileKind::Script,
            });
        }
        let kind = if file_name.ends_with(".sh") {
            CommandFileKind::SourceFile
        } else if file_name.starts_with('_') {
            CommandFileKind::Utility
        } else {
            return Err(anyhow!(
                "command file {} has no shebang; add one, rename it to *.sh to source it, or prefix it with '_'",
                path.display()
            ));
        };
        Ok(Self {
            name: file_name.to_string(),
            contents,
            kind,
        })
    }
}

pub fn load_command_files(paths: &[PathBuf]) -> Result<Vec<CommandFile>> {
    paths
        .iter()
        .map(|path| {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            CommandFile::classify(path, contents)
        })
        .collect()
}

/// A nonzero exit code while configuring the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSetupError {
    pub returncode: i32,
    pub output: String,
}

impl fmt::Display for EnvironmentSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Nonzero return code: {}\nOutput: {}",
            self.returncode, self.output
        )
    }
}

impl std::error::Error for EnvironmentSetupError {}

/// Quote `value` for a POSIX shell assignment.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Define the state command and assign `vars` in one `communicate`.
#[instrument(skip_all, fields(vars = vars.len()))]
pub fn set_environment_vars(
    env: &mut dyn Environment,
    state_command: Option<&StateCommand>,
    vars: &BTreeMap<String, String>,
) -> Result<()> {
    let lines: Vec<String> = state_command
        .map(|state| state.code.clone())
        .filter(|code| !code.trim().is_empty())
        .into_iter()
        .chain(vars.iter().map(|(k, v)| format!("{k}={}", shell_quote(v))))
        .collect();
    if lines.is_empty() {
        return Ok(());
    }
    let output = env
        .communicate(&lines.join("\n"))
        .context("set environment variables")?;
    let returncode = env.returncode();
    if returncode != 0 {
        warn!(returncode, "failed to set environment variables");
        return Err(EnvironmentSetupError { returncode, output }.into());
    }
    debug!("environment variables set");
    Ok(())
}

/// Read the current value of each named variable.
pub fn get_environment_vars<'a>(
    env: &mut dyn Environment,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for name in names {
        let value = env
            .communicate(&format!("echo ${name}"))
            .with_context(|| format!("read environment variable {name}"))?;
        vars.insert(name.clone(), value.trim().to_string());
    }
    Ok(vars)
}

/// Install an agent's variables, state command, and command files.
#[instrument(skip_all, fields(session = %env.session().session_id))]
pub fn install_agent_environment(env: &mut dyn Environment, config: &AgentConfig) -> Result<()> {
    info!("initializing agent settings for session");
    set_environment_vars(env, config.state_command.as_ref(), &config.env_variables)?;
    let files = load_command_files(&config.command_files)?;
    if !files.is_empty() {
        env.add_commands(&files).context("install command files")?;
    }
    Ok(())
}
