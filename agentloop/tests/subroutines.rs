//! Subroutine call stack: nested runtimes sharing the environment, stats, and the
//! caller's history list.

use std::collections::BTreeMap;
use std::rc::Rc;

use agentloop::agent::{Agent, RunRequest};
use agentloop::core::types::{Info, ReturnType, Role, RunOutput, StepField, TrajectoryStep};
use agentloop::io::config::AgentConfig;
use agentloop::io::environment::StepResult;
use agentloop::test_support::{
    SCRIPTED_QUERY_COST, ScriptedEnv, ScriptedModelFactory, agent_config, turn, with_subroutine,
};
use serde_json::{Map, Value};

fn run(
    config: AgentConfig,
    factory: &ScriptedModelFactory,
    env: &mut ScriptedEnv,
) -> (Agent, Info, Vec<TrajectoryStep>) {
    let mut setup_args = Map::new();
    setup_args.insert("issue".to_string(), Value::from("fix it"));
    let mut agent = Agent::new("primary", config, Rc::new(factory.clone())).expect("agent");
    let output = agent
        .run(
            RunRequest {
                setup_args,
                return_type: ReturnType::InfoTrajectory,
                ..RunRequest::default()
            },
            env,
        )
        .expect("run");
    let RunOutput::InfoTrajectory(info, trajectory) = output else {
        panic!("expected info and trajectory");
    };
    (agent, info, trajectory)
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.trim().to_string()).collect()
}

/// Verifies stats flow into the subroutine and back, so the caller ends with the
/// total over every query in the tree.
#[test]
fn stats_are_conserved_across_a_call() {
    let config = with_subroutine(
        agent_config(),
        "locate",
        agent_config(),
        None,
        ReturnType::Field(StepField::Thought),
    );
    let factory = ScriptedModelFactory::new(vec![
        ("primary", turn("delegate", "locate main function")),
        ("locate", turn("found it", "submit")),
        ("primary", turn("done", "submit")),
    ]);
    let mut env = ScriptedEnv::new();
    let (agent, info, trajectory) = run(config, &factory, &mut env);

    assert_eq!(agent.stats().api_calls, 3);
    assert!((agent.stats().instance_cost - 3.0 * SCRIPTED_QUERY_COST).abs() < 1e-9);
    assert_eq!(info.model_stats.as_ref(), Some(agent.stats()));
    assert_eq!(info.exit_status.as_deref(), Some("submitted"));

    // The nested run's return value is the caller's observation.
    assert_eq!(trajectory[0].observation, "found it\n");

    let queries = factory.queries();
    assert_eq!(queries[1].agent, "locate");
    let nested_instance = queries[1]
        .history
        .iter()
        .find(|e| e.role == Role::User)
        .expect("instance message");
    assert_eq!(nested_instance.content, "ISSUE: main function");
}

/// Verifies the nested history is spliced in but each runtime only sends its own
/// entries to the model.
#[test]
fn histories_are_scoped_by_owner() {
    let config = with_subroutine(
        agent_config(),
        "locate",
        agent_config(),
        None,
        ReturnType::Info,
    );
    let factory = ScriptedModelFactory::new(vec![
        ("primary", turn("delegate", "locate main")),
        ("locate", turn("found", "submit")),
        ("primary", turn("done", "submit")),
    ]);
    let mut env = ScriptedEnv::new();
    let (agent, _, _) = run(config, &factory, &mut env);

    assert!(
        agent
            .history()
            .iter()
            .any(|e| e.agent.as_deref() == Some("locate"))
    );
    let last = factory.queries().pop().expect("query");
    assert_eq!(last.agent, "primary");
    assert!(
        last.history
            .iter()
            .all(|e| e.agent.as_deref() == Some("primary"))
    );
}

/// Verifies the caller's variables and working directory are restored after the
/// nested run.
#[test]
fn environment_is_restored_after_call() {
    let mut vars = BTreeMap::new();
    vars.insert("CURRENT_FILE".to_string(), "a.py".to_string());
    let config = with_subroutine(
        AgentConfig {
            env_variables: vars,
            ..agent_config()
        },
        "locate",
        agent_config(),
        None,
        ReturnType::Info,
    );
    let factory = ScriptedModelFactory::new(vec![
        ("primary", turn("delegate", "locate main")),
        ("locate", turn("found", "submit")),
        ("primary", turn("done", "submit")),
    ]);
    let mut env = ScriptedEnv::new()
        .on_communicate("echo $CURRENT_FILE", "b.py\n", 0)
        .on_communicate("pwd -P", "/repo/src\n", 0);
    run(config, &factory, &mut env);

    let communications = env.communications();
    let call = communications
        .iter()
        .position(|c| c == "echo $CURRENT_FILE")
        .expect("snapshot");
    let restored = communications[call..]
        .iter()
        .position(|c| c == "CURRENT_FILE='b.py'")
        .expect("restore vars");
    let cd = communications[call..]
        .iter()
        .position(|c| c == "cd '/repo/src'")
        .expect("restore cwd");
    assert!(restored < cd);
}

/// Verifies a failing init observation is recorded under the subroutine's name
/// and ends the caller with `exit_error`.
#[test]
fn init_observation_failure_exits_caller() {
    let config = with_subroutine(
        agent_config(),
        "locate",
        agent_config(),
        Some("find_init {args}"),
        ReturnType::Info,
    );
    let factory = ScriptedModelFactory::new(vec![("primary", turn("delegate", "locate main"))]);
    let mut env = ScriptedEnv::new().on_step(
        "find_init main",
        StepResult {
            observation: "boom".to_string(),
            ..StepResult::default()
        },
        1,
    );
    let (agent, info, trajectory) = run(config, &factory, &mut env);

    assert_eq!(info.exit_status.as_deref(), Some("exit_error"));
    assert!(
        trajectory[0]
            .observation
            .contains("Nonzero return code: 1 for init_observation in locate")
    );
    let recorded = agent
        .history()
        .iter()
        .find(|e| e.content == "boom")
        .expect("init output in history");
    assert_eq!(recorded.agent.as_deref(), Some("locate"));
    assert_eq!(recorded.role, Role::User);
    assert_eq!(factory.remaining("locate"), 0);
    assert_eq!(trimmed(env.steps()), vec!["find_init main", "exit_error"]);
}

/// Verifies a successful init observation becomes the nested agent's first
/// observation.
#[test]
fn init_observation_feeds_first_nested_turn() {
    let config = with_subroutine(
        agent_config(),
        "locate",
        AgentConfig {
            instance_template: "ISSUE: {{ issue }}\nSEEN: {{ observation }}".to_string(),
            ..agent_config()
        },
        Some("find_init {args}"),
        ReturnType::Info,
    );
    let factory = ScriptedModelFactory::new(vec![
        ("primary", turn("delegate", "locate main")),
        ("locate", turn("ok", "submit")),
        ("primary", turn("done", "submit")),
    ]);
    let mut env = ScriptedEnv::new().on_step(
        "find_init main",
        StepResult {
            observation: "src/main.rs".to_string(),
            ..StepResult::default()
        },
        0,
    );
    run(config, &factory, &mut env);

    let nested = &factory.queries()[1];
    assert_eq!(nested.agent, "locate");
    assert_eq!(
        nested.history.last().map(|e| e.content.as_str()),
        Some("ISSUE: main\nSEEN: src/main.rs")
    );
}

/// Verifies a call beyond the depth limit ends that level with `exit_error` while
/// the levels above continue.
#[test]
fn depth_limit_stops_runaway_nesting() {
    let inner = agent_config();
    let outer = with_subroutine(agent_config(), "inner", inner, None, ReturnType::Info);
    let config = AgentConfig {
        max_subroutine_depth: 1,
        ..with_subroutine(agent_config(), "outer", outer, None, ReturnType::Info)
    };
    let factory = ScriptedModelFactory::new(vec![
        ("primary", turn("a", "outer go")),
        ("outer", turn("b", "inner deeper")),
        ("primary", turn("c", "submit")),
    ]);
    let mut env = ScriptedEnv::new();
    let (_, info, trajectory) = run(config, &factory, &mut env);

    assert_eq!(trimmed(env.steps()), vec!["exit_error", "submit"]);
    assert!(trajectory[0].observation.contains("exit_error"));
    assert_eq!(info.exit_status.as_deref(), Some("submitted"));
    assert!(factory.queries().iter().all(|q| q.agent != "inner"));
}
