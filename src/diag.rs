use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write a JSON diagnostic artifact under `debug_dir`, creating the
/// directory if needed. Artifacts are the audit trail for path-not-found
/// and destination failures; they are inspectable files, not log lines.
pub fn write_artifact<T: Serialize>(debug_dir: &Path, name: &str, payload: &T) -> Result<PathBuf> {
    fs::create_dir_all(debug_dir)
        .with_context(|| format!("creating debug directory {}", debug_dir.display()))?;
    let path = debug_dir.join(name);
    let json = serde_json::to_string_pretty(payload).context("serializing diagnostic artifact")?;
    fs::write(&path, json).with_context(|| format!("writing artifact {}", path.display()))?;
    info!(artifact = %path.display(), "wrote diagnostic artifact");
    Ok(path)
}
