//! Side-effecting adapters: forge, git, progress persistence, config.
//!
//! Each capability the orchestrator consumes is a trait here with one real
//! adapter. Tests swap the adapters for in-memory fakes from `test_support`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod forge;
pub mod git;
pub mod local;
pub mod process;
pub mod progress_store;
pub mod quest_store;
pub mod remote;

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
