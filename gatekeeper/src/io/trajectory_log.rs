//! Trajectory records on disk (pretty JSON).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::trajectory::Trajectory;

/// Load a recorded trajectory and check its step indices are contiguous.
pub fn load_trajectory(path: &Path) -> Result<Trajectory> {
    debug!(path = %path.display(), "loading trajectory");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trajectory {}", path.display()))?;
    let trajectory: Trajectory = serde_json::from_str(&contents)
        .with_context(|| format!("parse trajectory {}", path.display()))?;
    trajectory
        .check_sequence()
        .with_context(|| format!("validate trajectory {}", path.display()))?;
    debug!(steps = trajectory.len(), "trajectory loaded");
    Ok(trajectory)
}

/// Atomically write a trajectory (temp file + rename).
pub fn write_trajectory(path: &Path, trajectory: &Trajectory) -> Result<()> {
    debug!(path = %path.display(), steps = trajectory.len(), "writing trajectory");
    let mut buf = serde_json::to_string_pretty(trajectory)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp trajectory {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace trajectory {}", path.display()))?;
    Ok(())
}
