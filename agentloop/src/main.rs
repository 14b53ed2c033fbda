//! Command-line agent runner.
//!
//! Runs a configured agent against a local bash session, or inspects how an action
//! block would be split into dispatch units.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use agentloop::agent::{Agent, RunRequest};
use agentloop::cancel::is_interrupt;
use agentloop::core::guard::guard_multiline_input;
use agentloop::core::patterns::{PatternTables, PatternView};
use agentloop::core::splitter::split_actions;
use agentloop::core::types::{ReturnType, RunOutput};
use agentloop::exit_codes;
use agentloop::io::config::{AgentConfig, load_config};
use agentloop::io::model::ConfiguredModelFactory;
use agentloop::io::shell::{LocalShellEnv, ShellOptions};
use agentloop::logging;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

const PRIMARY_AGENT: &str = "primary";

#[derive(Parser)]
#[command(
    name = "agentloop",
    version,
    about = "Execution core of an autonomous shell agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the primary agent on one instance in a local bash session.
    Run {
        /// Agent config (TOML).
        #[arg(long)]
        config: PathBuf,
        /// Instance file (TOML) with `instance_id` and template variables such as `issue`.
        #[arg(long)]
        instance: PathBuf,
        /// Directory for `<instance_id>.traj`.
        #[arg(long)]
        traj_dir: Option<PathBuf>,
        /// Replay file (JSON) used for every non-human model.
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Working directory of the shell session.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Resume from a saved trajectory.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Per-command timeout.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Print the guarded, split dispatch units of an action block as JSON.
    Split {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value_t = ViewArg::Subroutine)]
        view: ViewArg,
        /// Skip the multi-line guard.
        #[arg(long)]
        no_guard: bool,
        /// File holding the action block.
        action_file: PathBuf,
    },
    /// Load and validate a config and compile its pattern tables.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ViewArg {
    Subroutine,
    MultiLine,
    MultiLineNoSubroutines,
}

impl From<ViewArg> for PatternView {
    fn from(value: ViewArg) -> Self {
        match value {
            ViewArg::Subroutine => PatternView::Subroutine,
            ViewArg::MultiLine => PatternView::MultiLine,
            ViewArg::MultiLineNoSubroutines => PatternView::MultiLineNoSubroutines,
        }
    }
}

/// Contents of `--instance`.
#[derive(Debug, Deserialize)]
struct InstanceFile {
    instance_id: String,
    #[serde(default)]
    persistent_volume: bool,
    #[serde(flatten)]
    args: Map<String, Value>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = if is_interrupt(&err) {
                exit_codes::INTERRUPTED
            } else {
                exit_codes::INVALID
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            instance,
            traj_dir,
            replay,
            workdir,
            checkpoint,
            timeout_secs,
        } => cmd_run(RunArgs {
            config,
            instance,
            traj_dir,
            replay,
            workdir,
            checkpoint,
            timeout: Duration::from_secs(timeout_secs),
        }),
        Command::Split {
            config,
            view,
            no_guard,
            action_file,
        } => cmd_split(&config, view.into(), no_guard, &action_file),
        Command::Check { config } => cmd_check(&config),
    }
}

struct RunArgs {
    config: PathBuf,
    instance: PathBuf,
    traj_dir: Option<PathBuf>,
    replay: Option<PathBuf>,
    workdir: PathBuf,
    checkpoint: Option<PathBuf>,
    timeout: Duration,
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let mut config = load_config(&args.config)?;
    if args.checkpoint.is_some() {
        config.checkpoint_path = args.checkpoint;
    }
    let instance = read_instance(&args.instance)?;

    let mut factory = ConfiguredModelFactory::new();
    if let Some(replay) = args.replay {
        factory = factory.with_replay_override(replay);
    }
    let mut agent = Agent::new(PRIMARY_AGENT, config, Rc::new(factory))?;

    let mut env = LocalShellEnv::spawn(ShellOptions {
        workdir: args.workdir,
        timeout: args.timeout,
        instance_id: instance.instance_id.clone(),
        name: "local".to_string(),
        persistent_volume: instance.persistent_volume,
    })?;
    let mut setup_args = instance.args;
    setup_args.insert("instance_id".to_string(), Value::String(instance.instance_id));

    let output = agent.run(
        RunRequest {
            setup_args,
            observation: None,
            traj_dir: args.traj_dir,
            return_type: ReturnType::Info,
            init_model_stats: None,
        },
        &mut env,
    )?;
    env.close()?;

    let info = match output {
        RunOutput::Info(info) | RunOutput::InfoTrajectory(info, _) => info,
        RunOutput::Value(_) => bail!("primary agent must return info"),
    };
    info!(exit_status = ?info.exit_status, "run finished");
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("serialize info")?
    );
    Ok(exit_codes::for_info(&info))
}

fn cmd_split(config: &Path, view: PatternView, no_guard: bool, action_file: &Path) -> Result<i32> {
    let config = load_config(config)?;
    let tables = compile_tables(&config)?;
    let action = fs::read_to_string(action_file)
        .with_context(|| format!("read {}", action_file.display()))?;
    let action = if no_guard {
        action
    } else {
        guard_multiline_input(&action, &tables)
    };
    let units = split_actions(&action, &tables, view, PRIMARY_AGENT);
    println!(
        "{}",
        serde_json::to_string_pretty(&units).context("serialize split actions")?
    );
    Ok(exit_codes::OK)
}

fn cmd_check(config: &Path) -> Result<i32> {
    let config = load_config(config)?;
    compile_tables(&config)?;
    println!(
        "ok: {} commands, {} subroutines",
        config.commands.len(),
        config.subroutines.len()
    );
    Ok(exit_codes::OK)
}

fn compile_tables(config: &AgentConfig) -> Result<PatternTables> {
    PatternTables::compile(
        &config.commands,
        &config.subroutine_commands(),
        &config.submit_command,
        config.submit_command_end_name.as_deref(),
    )
}

fn read_instance(path: &Path) -> Result<InstanceFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse instance {}", path.display()))
}
