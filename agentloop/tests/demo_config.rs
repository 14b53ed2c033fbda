//! The sample configuration under `demos/` loads, resolves, and compiles.

use std::path::PathBuf;

use agentloop::core::history::HistoryProcessor;
use agentloop::core::patterns::{PatternTables, PatternView};
use agentloop::core::splitter::split_actions;
use agentloop::core::types::{ReturnType, StepField};
use agentloop::io::config::load_config;
use agentloop::io::environment::{CommandFileKind, load_command_files};

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../demos")
        .join(name)
}

#[test]
fn demo_config_resolves_nested_agent() {
    let config = load_config(&demo("agent.toml")).expect("load");
    assert_eq!(config.commands.len(), 2);
    assert_eq!(
        config.history_processor,
        HistoryProcessor::LastNObservations { n: 5 }
    );

    let locate = config.subroutine("locate").expect("locate");
    assert_eq!(locate.return_type, ReturnType::Field(StepField::Thought));
    let nested = locate.agent().expect("nested agent");
    let replay = nested
        .model_config()
        .replay_path
        .expect("inherited replay path");
    assert!(replay.ends_with("replay.json"));
    assert!(replay.is_absolute());

    let files = load_command_files(&config.command_files).expect("command files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].kind, CommandFileKind::SourceFile);
}

#[test]
fn demo_actions_split_into_calls() {
    let config = load_config(&demo("agent.toml")).expect("load");
    let tables = PatternTables::compile(
        &config.commands,
        &config.subroutine_commands(),
        &config.submit_command,
        config.submit_command_end_name.as_deref(),
    )
    .expect("compile");
    let units = split_actions(
        "ls\nlocate greeting\nsubmit",
        &tables,
        PatternView::Subroutine,
        "primary",
    );
    let agents: Vec<&str> = units.iter().map(|u| u.agent.as_str()).collect();
    assert_eq!(agents, vec!["primary", "locate", "primary"]);
    assert_eq!(units[1].args.as_deref(), Some("greeting"));
}
