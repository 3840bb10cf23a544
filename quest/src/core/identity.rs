//! Deterministic identities for forge artifacts.
//!
//! Every issue and pull request the orchestrator creates carries a label
//! derived from `(instance, chapter, kind)`. Before creating anything the
//! dispatcher searches for that label, so retried or overlapping polls adopt
//! the existing artifact instead of filing a duplicate.

use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of identity labels.
pub const KEY_LABEL_PREFIX: &str = "quest-key-";
/// Label set on a chapter issue once the chapter is completed.
pub const COMPLETED_LABEL: &str = "quest-completed";
/// Label set on starter pull requests.
pub const STARTER_LABEL: &str = "quest-starter";
/// Label set on hard-reset pull requests.
pub const RESET_LABEL: &str = "quest-reset";

const DIGEST_HEX_LEN: usize = 12;

/// Kind of artifact an identity refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ChapterIssue,
    StarterPr,
    /// Hard-reset PR; `attempt` distinguishes successive resets of one chapter.
    ResetPr { attempt: u32 },
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::ChapterIssue => write!(f, "issue"),
            ArtifactKind::StarterPr => write!(f, "starter"),
            ArtifactKind::ResetPr { attempt } => write!(f, "reset-{attempt}"),
        }
    }
}

/// Identity of one forge artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub instance: String,
    pub chapter: usize,
    pub kind: ArtifactKind,
    label: String,
}

impl ArtifactKey {
    pub fn new(instance: &str, chapter: usize, kind: ArtifactKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(instance.as_bytes());
        hasher.update([0]);
        hasher.update(chapter.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(kind.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let label = format!("{KEY_LABEL_PREFIX}{}", &digest[..DIGEST_HEX_LEN]);
        Self {
            instance: instance.to_string(),
            chapter,
            kind,
            label,
        }
    }

    /// Forge label carrying this identity.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Head branch for pull-request identities.
    pub fn branch(&self) -> String {
        format!("quest/{}/chapter-{}-{}", self.instance, self.chapter + 1, self.kind)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/chapter-{}/{} ({})",
            self.instance,
            self.chapter + 1,
            self.kind,
            self.label
        )
    }
}

/// Human-facing chapter label (1-indexed).
pub fn chapter_label(chapter: usize) -> String {
    format!("quest-chapter-{}", chapter + 1)
}
