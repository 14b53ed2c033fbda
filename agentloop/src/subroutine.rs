//! Subroutine calls: a nested agent run on the caller's environment.
//!
//! The caller's environment variables and working directory are snapshotted before
//! the call and restored afterwards. Stats flow in from the caller and the nested
//! totals flow back out, so cost limits apply to the whole call tree. During
//! checkpoint replay the same call is re-run from its recorded turns.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, RunRequest};
use crate::core::types::{HistoryEntry, SplitAction};
use crate::io::config::SubroutineSpec;
use crate::io::environment::{
    Environment, get_environment_vars, set_environment_vars, shell_quote,
};
use crate::replay::{RecordedTurns, replay_action};

/// A subroutine call that cannot proceed. The caller ends its run with
/// `exit_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubroutineError {
    Unknown { name: String },
    DepthExceeded { name: String, limit: usize },
    InitFailed {
        name: String,
        returncode: i32,
        output: String,
    },
}

impl fmt::Display for SubroutineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubroutineError::Unknown { name } => write!(f, "unknown subroutine '{name}'"),
            SubroutineError::DepthExceeded { name, limit } => {
                write!(f, "subroutine '{name}' exceeds the call depth limit of {limit}")
            }
            SubroutineError::InitFailed {
                name,
                returncode,
                output,
            } => write!(
                f,
                "Nonzero return code: {returncode} for init_observation in {name}.\n{output}"
            ),
        }
    }
}

impl std::error::Error for SubroutineError {}

/// Run the subroutine named by `unit.agent` and return the observation its
/// configured return type produces.
#[instrument(skip_all, fields(caller = %caller.name(), subroutine = %unit.agent))]
pub fn call_subroutine(
    caller: &mut Agent,
    unit: &SplitAction,
    env: &mut dyn Environment,
) -> Result<Option<String>> {
    let name = unit.agent.as_str();
    let spec = lookup(caller, name)?;
    let saved = EnvSnapshot::take(caller, env)?;
    let args = unit.args.clone().unwrap_or_default();

    let observation = match spec.init_observation_for(&args) {
        Some(command) => {
            let result = env.step(&command)?;
            let returncode = env.returncode();
            if returncode != 0 {
                warn!(returncode, "init_observation failed");
                caller.append_history(HistoryEntry::user(result.observation.clone(), name));
                return Err(SubroutineError::InitFailed {
                    name: name.to_string(),
                    returncode,
                    output: result.observation,
                }
                .into());
            }
            Some(result.observation)
        }
        None => None,
    };

    info!(depth = caller.depth() + 1, args = %args, "calling subroutine");
    let mut nested = caller.nested(name, spec.agent()?.clone())?;
    let mut setup_args = Map::new();
    setup_args.insert("issue".to_string(), Value::String(args));
    let output = nested.run(
        RunRequest {
            setup_args,
            observation,
            traj_dir: None,
            return_type: spec.return_type,
            init_model_stats: Some(caller.stats().clone()),
        },
        env,
    )?;

    caller.splice_history(nested.history());
    saved.restore(caller, env)?;
    caller.replace_stats(nested.stats());
    info!(
        total_cost = nested.stats().total_cost,
        api_calls = nested.stats().api_calls,
        "subroutine returned"
    );
    Ok(output.into_observation())
}

/// Re-run a recorded subroutine call during checkpoint replay.
///
/// The nested agent's actions come from `turns` instead of the model. The caller's
/// history and stats were restored from the checkpoint and already hold the nested
/// run, so neither is touched.
#[instrument(skip_all, fields(caller = %caller.name(), subroutine = %unit.agent))]
pub fn replay_subroutine(
    caller: &mut Agent,
    unit: &SplitAction,
    env: &mut dyn Environment,
    turns: &mut RecordedTurns,
) -> Result<()> {
    let name = unit.agent.as_str();
    let spec = lookup(caller, name)?;
    let saved = EnvSnapshot::take(caller, env)?;
    let args = unit.args.clone().unwrap_or_default();

    if let Some(command) = spec.init_observation_for(&args) {
        let result = env.step(&command)?;
        let returncode = env.returncode();
        if returncode != 0 {
            return Err(SubroutineError::InitFailed {
                name: name.to_string(),
                returncode,
                output: result.observation,
            }
            .into());
        }
    }

    info!(depth = caller.depth() + 1, args = %args, "replaying subroutine");
    let mut nested = caller.nested(name, spec.agent()?.clone())?;
    if let Some(err) = nested.ensure_session(env)? {
        debug!(error = %err, "nested setup failed; recorded turns carry the exit");
    }
    let mut replayed = 0usize;
    while let Some(action) = turns.next_for(name) {
        replayed += 1;
        if replay_action(&mut nested, &action, env, turns)?.done {
            break;
        }
    }
    saved.restore(caller, env)?;
    info!(turns = replayed, "subroutine replayed");
    Ok(())
}

fn lookup(caller: &Agent, name: &str) -> Result<SubroutineSpec> {
    let spec = caller
        .config()
        .subroutine(name)
        .cloned()
        .ok_or_else(|| SubroutineError::Unknown {
            name: name.to_string(),
        })?;
    if caller.depth() >= caller.max_depth() {
        return Err(SubroutineError::DepthExceeded {
            name: name.to_string(),
            limit: caller.max_depth(),
        }
        .into());
    }
    Ok(spec)
}

/// The caller's variables and working directory, taken before a call.
struct EnvSnapshot {
    vars: BTreeMap<String, String>,
    cwd: String,
}

impl EnvSnapshot {
    fn take(caller: &Agent, env: &mut dyn Environment) -> Result<Self> {
        let vars = get_environment_vars(env, caller.config().env_variables.keys())?;
        let cwd = env.communicate("pwd -P")?.trim().to_string();
        Ok(Self { vars, cwd })
    }

    fn restore(self, caller: &Agent, env: &mut dyn Environment) -> Result<()> {
        set_environment_vars(env, caller.config().state_command.as_ref(), &self.vars)?;
        env.communicate(&format!("cd {}", shell_quote(&self.cwd)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_failure_message_names_the_subroutine() {
        let err = SubroutineError::InitFailed {
            name: "locate".to_string(),
            returncode: 2,
            output: "no such file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Nonzero return code: 2 for init_observation in locate.\nno such file"
        );
    }
}
