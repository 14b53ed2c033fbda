//! Checkpoint replay: restoring history and stats from a saved trajectory and
//! re-executing its actions before the live loop continues.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use agentloop::agent::{Agent, RunRequest};
use agentloop::core::commands::CommandSpec;
use agentloop::core::stats::ApiStats;
use agentloop::core::types::{HistoryEntry, Info, ReturnType, RunOutput, StepField};
use agentloop::io::config::AgentConfig;
use agentloop::io::trajectory::load_checkpoint;
use agentloop::test_support::{
    Reply, ScriptedEnv, ScriptedModelFactory, agent_config, turn, with_subroutine,
};
use serde_json::{Map, Value, json};

fn write_checkpoint(path: &Path, actions: &[&str], history: Value) {
    let trajectory: Vec<Value> = actions
        .iter()
        .map(|action| {
            json!({
                "action": action,
                "observation": "",
                "response": action,
                "state": null,
                "thought": ""
            })
        })
        .collect();
    let checkpoint = json!({
        "environment": "scripted",
        "trajectory": trajectory,
        "history": history,
        "info": {
            "model_stats": {
                "total_cost": 1.0,
                "instance_cost": 1.0,
                "tokens_sent": 100,
                "tokens_received": 20,
                "api_calls": 2
            }
        }
    });
    fs::write(path, serde_json::to_string_pretty(&checkpoint).expect("json")).expect("write");
}

fn saved_history() -> Value {
    json!([
        {"role": "system", "content": "SYSTEM", "agent": "primary"},
        {"role": "user", "content": "ISSUE: fix it", "agent": "primary"},
        {"role": "assistant", "content": "ls", "thought": "", "action": "ls", "agent": "primary"},
        {"role": "user", "content": "OBSERVATION: ran ls", "agent": "primary"},
        {"role": "assistant", "content": "Exit due to cost limit", "thought": "Exit due to cost limit", "action": "exit_cost", "agent": "primary"}
    ])
}

fn request(traj_dir: &Path) -> RunRequest {
    let mut setup_args = Map::new();
    setup_args.insert("issue".to_string(), Value::from("fix it"));
    RunRequest {
        setup_args,
        traj_dir: Some(traj_dir.to_path_buf()),
        return_type: ReturnType::InfoTrajectory,
        ..RunRequest::default()
    }
}

/// Verifies a run cut short by the cost limit resumes after its last real step.
#[test]
fn cost_exit_checkpoint_resumes_live_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join("checkpoint.traj");
    write_checkpoint(&checkpoint, &["ls", "exit_cost"], saved_history());
    let config = AgentConfig {
        checkpoint_path: Some(checkpoint),
        ..agent_config()
    };
    let factory = ScriptedModelFactory::new(vec![("primary", turn("resume", "submit"))]);
    let mut env = ScriptedEnv::new();
    let mut agent = Agent::new("primary", config, Rc::new(factory.clone())).expect("agent");
    let output = agent.run(request(temp.path()), &mut env).expect("run");
    let RunOutput::InfoTrajectory(info, trajectory) = output else {
        panic!("expected info and trajectory");
    };

    let steps: Vec<String> = env.steps().iter().map(|s| s.trim().to_string()).collect();
    assert_eq!(steps, vec!["ls", "submit"]);
    assert_eq!(trajectory.len(), 2);
    assert_eq!(trajectory[0].action, "ls");
    assert_eq!(info.exit_status.as_deref(), Some("submitted"));

    // Restored counters plus one live query.
    assert_eq!(agent.stats().api_calls, 3);
    assert_eq!(agent.stats().tokens_sent, 110);

    let queries = factory.queries();
    assert_eq!(queries.len(), 1);
    let sent = &queries[0].history;
    assert!(sent.iter().all(|e| e.action.as_deref() != Some("exit_cost")));
    assert_eq!(sent.last().map(|e| e.content.as_str()), Some("NO OUTPUT"));

    let saved = load_checkpoint(&temp.path().join("inst-1.traj")).expect("saved");
    assert_eq!(saved.trajectory.len(), 2);
}

/// Verifies a checkpoint whose replay reaches submit finishes without querying.
#[test]
fn replayed_submit_skips_live_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join("checkpoint.traj");
    let history = json!([
        {"role": "system", "content": "SYSTEM", "agent": "primary"},
        {"role": "user", "content": "ISSUE: fix it", "agent": "primary"}
    ]);
    write_checkpoint(&checkpoint, &["ls", "ls\nsubmit\necho after"], history);
    let config = AgentConfig {
        checkpoint_path: Some(checkpoint),
        ..agent_config()
    };
    let factory = ScriptedModelFactory::new(Vec::new());
    let mut env = ScriptedEnv::new();
    let mut agent = Agent::new("primary", config, Rc::new(factory.clone())).expect("agent");
    let output = agent.run(request(temp.path()), &mut env).expect("run");

    assert!(factory.queries().is_empty());
    let steps: Vec<String> = env.steps().iter().map(|s| s.trim().to_string()).collect();
    assert_eq!(steps, vec!["ls", "ls", "submit"]);
    let RunOutput::InfoTrajectory(info, trajectory) = output else {
        panic!("expected info and trajectory");
    };
    assert_eq!(trajectory.len(), 2);
    assert_eq!(info.exit_status.as_deref(), Some("submitted"));
    assert!(temp.path().join("inst-1.traj").exists());
}

/// Verifies a trailing cost exit without its assistant entry is rejected.
#[test]
fn unpaired_cost_exit_is_corrupt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join("checkpoint.traj");
    let history = json!([{"role": "user", "content": "ISSUE: fix it", "agent": "primary"}]);
    write_checkpoint(&checkpoint, &["exit_cost"], history);
    let config = AgentConfig {
        checkpoint_path: Some(checkpoint),
        ..agent_config()
    };
    let factory = ScriptedModelFactory::new(Vec::new());
    let mut agent = Agent::new("primary", config, Rc::new(factory)).expect("agent");
    let err = agent
        .run(request(temp.path()), &mut ScriptedEnv::new())
        .expect_err("corrupt");
    assert!(format!("{err:#}").contains("corrupt checkpoint"));
}

/// A live run cut short by the cost limit, and a second run resumed from the
/// trajectory the first one saved.
struct Resumed {
    live_steps: Vec<String>,
    live_history: Vec<HistoryEntry>,
    live_stats: ApiStats,
    steps: Vec<String>,
    communications: Vec<String>,
    agent: Agent,
    factory: ScriptedModelFactory,
    info: Info,
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.trim().to_string()).collect()
}

fn live_then_resume(
    config: AgentConfig,
    live: Vec<(&str, Reply)>,
    resumed: Vec<(&str, Reply)>,
) -> Resumed {
    let temp = tempfile::tempdir().expect("tempdir");
    let live_dir = temp.path().join("live");
    let mut live_env = ScriptedEnv::new();
    let mut live_agent = Agent::new(
        "primary",
        config.clone(),
        Rc::new(ScriptedModelFactory::new(live)),
    )
    .expect("agent");
    let output = live_agent
        .run(request(&live_dir), &mut live_env)
        .expect("live run");
    let RunOutput::InfoTrajectory(live_info, _) = output else {
        panic!("expected info and trajectory");
    };
    assert_eq!(live_info.exit_status.as_deref(), Some("exit_cost"));

    let config = AgentConfig {
        checkpoint_path: Some(live_dir.join("inst-1.traj")),
        ..config
    };
    let factory = ScriptedModelFactory::new(resumed);
    let mut env = ScriptedEnv::new();
    let mut agent = Agent::new("primary", config, Rc::new(factory.clone())).expect("agent");
    let output = agent
        .run(request(&temp.path().join("resumed")), &mut env)
        .expect("resumed run");
    let RunOutput::InfoTrajectory(info, _) = output else {
        panic!("expected info and trajectory");
    };
    Resumed {
        live_steps: trimmed(live_env.steps()),
        live_history: live_agent.history().to_vec(),
        live_stats: live_agent.stats().clone(),
        steps: trimmed(env.steps()),
        communications: env.communications(),
        agent,
        factory,
        info,
    }
}

impl Resumed {
    /// The resumed history starts with the live one minus its cost exit turn.
    fn assert_history_restored(&self) {
        let kept = &self.live_history[..self.live_history.len() - 1];
        assert_eq!(&self.agent.history()[..kept.len()], kept);
    }

    fn assert_only_primary_queried_once(&self) {
        let agents: Vec<String> = self.factory.queries().into_iter().map(|q| q.agent).collect();
        assert_eq!(agents, vec!["primary"]);
        assert_eq!(self.agent.stats().api_calls, self.live_stats.api_calls + 1);
    }
}

/// Verifies a recorded block command is re-sent with the same here-document text
/// live dispatch used.
#[test]
fn replayed_block_command_matches_live_dispatch() {
    let r = live_then_resume(
        agent_config(),
        vec![
            ("primary", turn("edit it", "edit 1:1\nx = 1\nend_of_edit")),
            ("primary", Reply::Cost),
        ],
        vec![("primary", turn("done", "submit"))],
    );

    assert!(r.live_steps[0].starts_with("edit 1:1 << 'end_of_edit'\nx = 1"));
    assert_eq!(r.steps, vec![r.live_steps[0].clone(), "submit".to_string()]);
    assert_eq!(r.info.exit_status.as_deref(), Some("submitted"));
    r.assert_history_restored();
    r.assert_only_primary_queried_once();
}

/// Verifies a recorded single-line subroutine call is delegated again and runs the
/// nested agent's recorded actions without querying it.
#[test]
fn replayed_subroutine_call_reuses_recorded_turns() {
    let config = with_subroutine(
        agent_config(),
        "locate",
        agent_config(),
        None,
        ReturnType::Field(StepField::Thought),
    );
    let r = live_then_resume(
        config,
        vec![
            ("primary", turn("delegate", "locate main function")),
            ("locate", turn("look", "open a.py")),
            ("locate", turn("found", "submit")),
            ("primary", Reply::Cost),
        ],
        vec![("primary", turn("done", "submit"))],
    );

    assert_eq!(r.live_steps, vec!["open a.py", "submit", "exit_cost"]);
    assert_eq!(r.steps, vec!["open a.py", "submit", "submit"]);
    assert!(r.steps.iter().all(|s| s != "locate main function"));
    assert!(r.communications.iter().any(|c| c == "cd '/repo'"));
    r.assert_history_restored();
    r.assert_only_primary_queried_once();

    // Nested entries come from the checkpoint only; replay adds none.
    fn owned_by_locate(history: &[HistoryEntry]) -> usize {
        history
            .iter()
            .filter(|e| e.agent.as_deref() == Some("locate"))
            .count()
    }
    assert_eq!(
        owned_by_locate(r.agent.history()),
        owned_by_locate(&r.live_history)
    );
}

/// Verifies a recorded block subroutine call replays its init observation and the
/// nested actions in order.
#[test]
fn replayed_block_subroutine_runs_init_then_nested_actions() {
    let mut config = with_subroutine(
        agent_config(),
        "plan",
        agent_config(),
        Some("prepare {args}"),
        ReturnType::Info,
    );
    config.subroutines[0].command = CommandSpec::block("plan", "end_plan");
    let r = live_then_resume(
        config,
        vec![
            ("primary", turn("plan it", "plan\nstep one\nend_plan")),
            ("plan", turn("open", "open b.py")),
            ("plan", turn("done", "submit")),
            ("primary", Reply::Cost),
        ],
        vec![("primary", turn("done", "submit"))],
    );

    assert_eq!(
        r.live_steps,
        vec!["prepare step one", "open b.py", "submit", "exit_cost"]
    );
    assert_eq!(
        r.steps,
        vec!["prepare step one", "open b.py", "submit", "submit"]
    );
    r.assert_history_restored();
    r.assert_only_primary_queried_once();
}
