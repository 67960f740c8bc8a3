//! Helper scripts ("skills") the agent can call from its workspace.
//!
//! Every regular, non-hidden file in the local skills directory is copied to
//! `<workspace>/scripts/` at setup and again before every run, so edits to a
//! skill reach running machines without re-provisioning. `*.sh` files are
//! made executable on the target.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::layout;
use crate::io::backend::{Backend, sh_path};

/// Skill files in `dir`, sorted by name. A missing directory has none.
pub fn local_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.context("read skills entry")?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !entry.file_type().context("stat skills entry")?.is_file() {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

/// Copy the skills in `dir` to the target's scripts directory and return the
/// deployed file names.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn deploy(backend: &dyn Backend, dir: &Path) -> Result<Vec<String>> {
    let files = local_files(dir)?;
    if files.is_empty() {
        debug!("no skills to deploy");
        return Ok(Vec::new());
    }
    let dest_dir = layout::scripts_dir(&backend.target().workspace);
    backend.run_checked(
        &format!("mkdir -p {}", sh_path(&dest_dir)),
        "create scripts directory",
    )?;

    let mut names = Vec::with_capacity(files.len());
    for file in &files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("non-utf8 skill name {}", file.display()))?;
        backend
            .copy_to(file, &layout::join(&dest_dir, name))
            .with_context(|| format!("upload skill {name}"))?;
        names.push(name.to_string());
    }

    let scripts: Vec<String> = names
        .iter()
        .filter(|n| n.ends_with(".sh"))
        .map(|n| sh_path(&layout::join(&dest_dir, n)))
        .collect();
    if !scripts.is_empty() {
        backend.run_checked(&format!("chmod +x {}", scripts.join(" ")), "chmod skills")?;
    }
    info!(count = names.len(), "skills deployed");
    Ok(names)
}
