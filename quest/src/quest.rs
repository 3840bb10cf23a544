//! Quest authoring data: the immutable chapter sequence a learner works through.
//!
//! A [`Quest`] is loaded once per instance and shared behind an `Arc`. Chapters
//! are addressed by index into [`Quest::chapters`]; nothing at runtime holds a
//! reference back from a chapter to its quest.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Default ref holding the quest's initial commit.
pub const DEFAULT_INITIAL_REF: &str = "upstream/initial";

/// An authored multi-chapter exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quest {
    /// Stable quest identifier (e.g. `rust-async`).
    pub id: String,
    /// Template repository the quest was cloned from (`owner/name`).
    pub template: String,
    /// Ref holding the initial content of `protected` paths.
    #[serde(default = "default_initial_ref")]
    pub initial_ref: String,
    /// Paths protected from the very first chapter.
    #[serde(default)]
    pub protected: Vec<String>,
    pub chapters: Vec<Chapter>,
}

/// One step of a quest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Short slug, unique within the quest (e.g. `chat-server`).
    pub label: String,
    /// Issue title filed when the chapter starts.
    pub title: String,
    /// Issue body filed when the chapter starts.
    #[serde(default)]
    pub issue_body: String,
    #[serde(default)]
    pub starter: Option<Starter>,
    #[serde(default)]
    pub solution: Option<Solution>,
}

/// Starter code delivered to the learner as a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Starter {
    /// Ref whose content is the chapter's starter state.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Paths this starter owns. Later chapters supersede earlier ones.
    #[serde(default)]
    pub protected: Vec<String>,
}

/// Reference solution for a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

fn default_initial_ref() -> String {
    DEFAULT_INITIAL_REF.to_string()
}

impl Quest {
    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.chapters.len()
    }

    /// Protected paths in force for `chapter`, mapped to the ref holding their expected content.
    ///
    /// Chapters before `chapter` always contribute their starter manifest;
    /// `chapter` itself contributes only once its starter has been applied.
    pub fn effective_manifest(
        &self,
        chapter: usize,
        starter_applied: bool,
    ) -> BTreeMap<String, String> {
        let mut manifest = BTreeMap::new();
        for path in &self.protected {
            manifest.insert(path.clone(), self.initial_ref.clone());
        }
        for (index, ch) in self.chapters.iter().enumerate() {
            if index > chapter || (index == chapter && !starter_applied) {
                break;
            }
            if let Some(starter) = &ch.starter {
                for path in &starter.protected {
                    manifest.insert(path.clone(), starter.git_ref.clone());
                }
            }
        }
        manifest
    }

    /// Ref of the most recently applied known-good state for `chapter`.
    pub fn applied_baseline(&self, chapter: usize, starter_applied: bool) -> &str {
        let upto = if starter_applied {
            chapter + 1
        } else {
            chapter
        };
        self.chapters
            .iter()
            .take(upto)
            .rev()
            .find_map(|ch| ch.starter.as_ref().map(|s| s.git_ref.as_str()))
            .unwrap_or(&self.initial_ref)
    }

    /// Check authoring invariants. Returns stable error messages (empty when valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("quest id must be non-empty".to_string());
        }
        if self.chapters.is_empty() {
            errors.push("quest must have at least one chapter".to_string());
        }
        if self.initial_ref.trim().is_empty() {
            errors.push("initial_ref must be non-empty".to_string());
        }
        for path in &self.protected {
            check_manifest_path(path, "quest", &mut errors);
        }

        let mut labels = HashSet::new();
        for (index, chapter) in self.chapters.iter().enumerate() {
            if chapter.label.trim().is_empty() {
                errors.push(format!("chapter {index}: label must be non-empty"));
            } else if !labels.insert(chapter.label.as_str()) {
                errors.push(format!("duplicate chapter label '{}'", chapter.label));
            }
            if let Some(starter) = &chapter.starter {
                if starter.git_ref.trim().is_empty() {
                    errors.push(format!(
                        "chapter '{}': starter ref must be non-empty",
                        chapter.label
                    ));
                }
                for path in &starter.protected {
                    check_manifest_path(path, &chapter.label, &mut errors);
                }
            }
            if let Some(solution) = &chapter.solution
                && solution.git_ref.trim().is_empty()
            {
                errors.push(format!("chapter '{}': solution ref must be non-empty", chapter.label));
            }
        }
        errors
    }
}

fn check_manifest_path(path: &str, owner: &str, errors: &mut Vec<String>) {
    let parsed = Path::new(path);
    let relative = !path.is_empty()
        && parsed
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !relative {
        errors.push(format!(
            "{owner}: protected path '{path}' must be a plain relative path"
        ));
    }
}

/// A learner's running copy of a quest.
#[derive(Debug, Clone)]
pub struct QuestInstance {
    /// Identifier used for persistence and artifact identities.
    pub id: String,
    /// Forge repository of the learner's clone (`owner/name`).
    pub repository: String,
    /// Local working copy.
    pub workdir: PathBuf,
    pub quest: Arc<Quest>,
}

impl QuestInstance {
    pub fn new(
        id: impl Into<String>,
        repository: impl Into<String>,
        workdir: impl Into<PathBuf>,
        quest: Arc<Quest>,
    ) -> Self {
        Self {
            id: id.into(),
            repository: repository.into(),
            workdir: workdir.into(),
            quest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{chapter, chapter_with_starter, quest_with};

    #[test]
    fn effective_manifest_starts_from_quest_protected_paths() {
        let mut quest = quest_with(vec![chapter("one")]);
        quest.protected = vec!["Cargo.toml".to_string()];
        let manifest = quest.effective_manifest(0, false);
        assert_eq!(manifest.get("Cargo.toml").map(String::as_str), Some(DEFAULT_INITIAL_REF));
    }

    #[test]
    fn effective_manifest_includes_current_starter_only_once_applied() {
        let quest = quest_with(vec![
            chapter_with_starter("one", "upstream/one", &["src/lib.rs"]),
            chapter_with_starter("two", "upstream/two", &["src/lib.rs", "src/net.rs"]),
        ]);

        let before = quest.effective_manifest(1, false);
        assert_eq!(before.get("src/lib.rs").map(String::as_str), Some("upstream/one"));
        assert!(!before.contains_key("src/net.rs"));

        let after = quest.effective_manifest(1, true);
        assert_eq!(after.get("src/lib.rs").map(String::as_str), Some("upstream/two"));
        assert_eq!(after.get("src/net.rs").map(String::as_str), Some("upstream/two"));
    }

    #[test]
    fn applied_baseline_falls_back_to_initial_ref() {
        let quest = quest_with(vec![
            chapter("one"),
            chapter_with_starter("two", "upstream/two", &["a.rs"]),
        ]);
        assert_eq!(quest.applied_baseline(1, false), DEFAULT_INITIAL_REF);
        assert_eq!(quest.applied_baseline(1, true), "upstream/two");
    }

    #[test]
    fn validate_reports_duplicate_labels_and_absolute_paths() {
        let mut quest = quest_with(vec![
            chapter_with_starter("one", "upstream/one", &["/etc/passwd"]),
            chapter("one"),
        ]);
        quest.protected = vec!["../outside".to_string()];
        let errors = quest.validate();
        assert!(errors.iter().any(|err| err.contains("duplicate chapter label")));
        assert!(errors.iter().any(|err| err.contains("/etc/passwd")));
        assert!(errors.iter().any(|err| err.contains("../outside")));
    }

    #[test]
    fn validate_rejects_empty_quest() {
        let quest = quest_with(Vec::new());
        let errors = quest.validate();
        assert!(errors.iter().any(|err| err.contains("at least one chapter")));
    }
}
