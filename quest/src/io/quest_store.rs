//! Loading quest definitions (TOML) from a file or a git ref.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::QuestSource;
use crate::io::git::{FileAt, LocalGit};
use crate::quest::Quest;

/// Parse and validate a quest definition.
pub fn parse_quest(text: &str) -> Result<Quest> {
    let quest: Quest = toml::from_str(text).context("parse quest definition")?;
    let errors = quest.validate();
    if !errors.is_empty() {
        return Err(anyhow!("invalid quest definition:\n- {}", errors.join("\n- ")));
    }
    Ok(quest)
}

/// Load the quest for a working copy.
///
/// `source.file` (relative to `workdir`) wins over the git ref.
pub fn load_quest<G: LocalGit + ?Sized>(
    git: &G,
    workdir: &Path,
    source: &QuestSource,
) -> Result<Quest> {
    if let Some(file) = &source.file {
        let path = workdir.join(file);
        debug!(path = %path.display(), "loading quest from file");
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        return parse_quest(&text).with_context(|| format!("load {}", path.display()));
    }

    debug!(git_ref = %source.manifest_ref, path = %source.manifest_path, "loading quest from git");
    let text = git
        .read_file(&source.manifest_path, FileAt::Rev(&source.manifest_ref))
        .with_context(|| format!("read {}:{}", source.manifest_ref, source.manifest_path))?
        .ok_or_else(|| {
            anyhow!(
                "no quest definition at {}:{}",
                source.manifest_ref,
                source.manifest_path
            )
        })?;
    parse_quest(&text)
        .with_context(|| format!("load {}:{}", source.manifest_ref, source.manifest_path))
}
