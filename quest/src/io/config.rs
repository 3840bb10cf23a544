//! Orchestrator configuration stored under `.git/quest/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::conflict::{
    ConflictPolicy, DEFAULT_BEGIN_MARKER, DEFAULT_END_MARKER, WhitespacePolicy,
};

/// Directory (inside the clone's git dir) holding orchestrator files.
pub fn quest_dir(workdir: &Path) -> PathBuf {
    workdir.join(".git").join("quest")
}

/// Default config location for a working copy.
pub fn config_path(workdir: &Path) -> PathBuf {
    quest_dir(workdir).join("config.toml")
}

/// Orchestrator configuration (TOML).
///
/// Hand-editable. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuestConfig {
    /// Instance identifier. Defaults to the working copy's directory name.
    pub instance_id: Option<String>,
    pub poll: PollConfig,
    pub forge: ForgeConfig,
    pub conflict: ConflictConfig,
    pub quest: QuestSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    /// Seconds between timer-triggered polls.
    pub interval_secs: u64,
    /// Recomputations allowed per cycle after `ActionConflict`/`StaleRevision`.
    pub max_recomputes: u32,
    /// Run `git fetch` before observing local state.
    pub fetch: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_recomputes: 2,
            fetch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// `owner/name`. Derived from the `origin` remote when unset.
    pub repository: Option<String>,
    pub gh_binary: String,
    /// Exported as `GH_CONFIG_DIR` so `gh` uses a dedicated credential store.
    pub gh_config_dir: Option<PathBuf>,
    /// Per-call timeout for `gh` invocations.
    pub timeout_secs: u64,
    pub default_branch: String,
    /// Branch the learner works on; starter and reset PRs target it.
    pub learner_branch: String,
    /// Merge hard-reset PRs right after filing them.
    pub auto_merge_resets: bool,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            repository: None,
            gh_binary: "gh".to_string(),
            gh_config_dir: None,
            timeout_secs: 20,
            default_branch: "main".to_string(),
            learner_branch: "main".to_string(),
            auto_merge_resets: false,
        }
    }
}

impl ForgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConflictConfig {
    pub whitespace: WhitespacePolicy,
    pub game_area_begin: String,
    pub game_area_end: String,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            whitespace: WhitespacePolicy::default(),
            game_area_begin: DEFAULT_BEGIN_MARKER.to_string(),
            game_area_end: DEFAULT_END_MARKER.to_string(),
        }
    }
}

impl ConflictConfig {
    pub fn policy(&self) -> ConflictPolicy {
        ConflictPolicy {
            whitespace: self.whitespace,
            begin_marker: self.game_area_begin.clone(),
            end_marker: self.game_area_end.clone(),
        }
    }
}

/// Where the quest definition is read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuestSource {
    /// Git ref holding the definition.
    pub manifest_ref: String,
    /// Path of the definition within `manifest_ref`.
    pub manifest_path: String,
    /// Local file overriding the git ref.
    pub file: Option<PathBuf>,
}

impl Default for QuestSource {
    fn default() -> Self {
        Self {
            manifest_ref: "origin/meta".to_string(),
            manifest_path: "quest.toml".to_string(),
            file: None,
        }
    }
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            poll: PollConfig::default(),
            forge: ForgeConfig::default(),
            conflict: ConflictConfig::default(),
            quest: QuestSource::default(),
        }
    }
}

impl QuestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(anyhow!("poll.interval_secs must be > 0"));
        }
        if self.forge.timeout_secs == 0 {
            return Err(anyhow!("forge.timeout_secs must be > 0"));
        }
        if self.forge.gh_binary.trim().is_empty() {
            return Err(anyhow!("forge.gh_binary must be non-empty"));
        }
        if self.forge.default_branch.trim().is_empty()
            || self.forge.learner_branch.trim().is_empty()
        {
            return Err(anyhow!("forge branches must be non-empty"));
        }
        if let Some(repository) = &self.forge.repository
            && repository.split('/').filter(|part| !part.is_empty()).count() != 2
        {
            return Err(anyhow!(
                "forge.repository must look like owner/name, got '{repository}'"
            ));
        }
        let begin = self.conflict.game_area_begin.trim();
        let end = self.conflict.game_area_end.trim();
        if begin.is_empty() || end.is_empty() {
            return Err(anyhow!("conflict markers must be non-empty"));
        }
        if begin.contains(end) || end.contains(begin) {
            return Err(anyhow!(
                "conflict.game_area_begin and conflict.game_area_end must not contain each other"
            ));
        }
        if let Some(id) = &self.instance_id
            && id.trim().is_empty()
        {
            return Err(anyhow!("instance_id must be non-empty when set"));
        }
        Ok(())
    }

    /// Instance id for `workdir`: the configured one or the directory name.
    pub fn instance_id_for(&self, workdir: &Path) -> String {
        self.instance_id.clone().unwrap_or_else(|| {
            workdir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "quest".to_string())
        })
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `QuestConfig::default()`.
pub fn load_config(path: &Path) -> Result<QuestConfig> {
    if !path.exists() {
        let cfg = QuestConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: QuestConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &QuestConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
