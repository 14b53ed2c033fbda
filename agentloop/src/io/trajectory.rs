//! Trajectory files: the persisted record of a run, checkpoints, and demonstrations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::stats::ApiStats;
use crate::core::template_select::CodegraphContext;
use crate::core::types::{HistoryEntry, Info, TrajectoryStep};

const CHECKPOINT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/checkpoint.schema.json"
));

/// Everything written to `<traj_dir>/<instance_id>.traj`.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryRecord<'a> {
    pub environment: &'a str,
    pub trajectory: &'a [TrajectoryStep],
    pub history: &'a [HistoryEntry],
    pub codegraph: &'a [CodegraphContext],
    pub info: &'a Info,
}

pub fn trajectory_path(traj_dir: &Path, instance_id: &str) -> PathBuf {
    traj_dir.join(format!("{instance_id}.traj"))
}

/// Rewrite the whole trajectory file (temp file + rename).
pub fn write_trajectory(path: &Path, record: &TrajectoryRecord<'_>) -> Result<()> {
    debug!(path = %path.display(), steps = record.trajectory.len(), "writing trajectory");
    let mut buf = serde_json::to_string_pretty(record).context("serialize trajectory")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("trajectory path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("traj.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp trajectory {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace trajectory {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointInfo {
    pub model_stats: ApiStats,
}

/// A previously written trajectory used to resume a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Checkpoint {
    pub trajectory: Vec<TrajectoryStep>,
    pub history: Vec<HistoryEntry>,
    pub info: CheckpointInfo,
}

/// Load a checkpoint, validating it against the bundled schema first.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let value = read_json(path)?;
    validate_checkpoint(&value).with_context(|| format!("validate {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

fn validate_checkpoint(instance: &Value) -> Result<()> {
    static SCHEMA: LazyLock<Value> =
        LazyLock::new(|| serde_json::from_str(CHECKPOINT_SCHEMA).unwrap());
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&*SCHEMA)
        .map_err(|err| anyhow!("invalid checkpoint schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("checkpoint schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// The `history` of a demonstration trajectory.
pub fn load_demonstration(path: &Path) -> Result<Vec<HistoryEntry>> {
    #[derive(Deserialize)]
    struct Demonstration {
        history: Vec<HistoryEntry>,
    }
    let demo: Demonstration = serde_json::from_value(read_json(path)?)
        .with_context(|| format!("deserialize demonstration {}", path.display()))?;
    Ok(demo.history)
}

fn read_json(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
