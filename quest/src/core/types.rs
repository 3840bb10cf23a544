//! Shared deterministic types for quest reconciliation.
//!
//! These types define stable contracts between the readers, the state machine
//! and the dispatcher. They carry no handles to external state.

use serde::{Deserialize, Serialize};

use crate::core::identity::ArtifactKey;

/// Progress of the current chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterPhase {
    NotStarted,
    IssueFiled,
    StarterAvailable,
    InProgress,
    Completed,
    /// A hard-reset PR has been filed and awaits merge.
    Resetting,
    /// The last chapter was completed. Terminal.
    Finished,
}

impl ChapterPhase {
    /// True when the chapter's starter code is part of the learner branch.
    pub fn starter_applied(self) -> bool {
        matches!(
            self,
            ChapterPhase::InProgress | ChapterPhase::Completed | ChapterPhase::Finished
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChapterPhase::NotStarted => "not_started",
            ChapterPhase::IssueFiled => "issue_filed",
            ChapterPhase::StarterAvailable => "starter_available",
            ChapterPhase::InProgress => "in_progress",
            ChapterPhase::Completed => "completed",
            ChapterPhase::Resetting => "resetting",
            ChapterPhase::Finished => "finished",
        }
    }
}

/// Why a hard reset was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// Learner edits reached protected starter code.
    Drift,
    /// Learner asked for the chapter's reference solution.
    ReferenceSolution,
    /// Learner asked for the solution but the chapter has none; restore the starter state.
    StarterRestore,
}

/// Bookkeeping for an in-flight hard reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetState {
    pub reason: ResetReason,
    /// Phase the chapter was in when the reset was filed.
    pub from: ChapterPhase,
    /// Reset attempt number within the chapter (1-indexed).
    pub attempt: u32,
}

/// Forge artifact numbers created for the current chapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPins {
    pub issue: Option<u64>,
    pub starter_pr: Option<u64>,
    pub reset_pr: Option<u64>,
}

/// Persisted progress for one quest instance.
///
/// `revision` increases by exactly one on every persisted change and is the
/// compare-and-swap token for concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub chapter: usize,
    pub phase: ChapterPhase,
    pub revision: u64,
    /// Hard resets filed in the current chapter.
    #[serde(default)]
    pub resets: u32,
    #[serde(default)]
    pub reset: Option<ResetState>,
    #[serde(default)]
    pub pins: ArtifactPins,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            chapter: 0,
            phase: ChapterPhase::NotStarted,
            revision: 0,
            resets: 0,
            reset: None,
            pins: ArtifactPins::default(),
        }
    }
}

impl ProgressRecord {
    /// Whether the current chapter's starter has landed, looking through an in-flight reset.
    pub fn starter_applied(&self) -> bool {
        match (self.phase, self.reset) {
            (ChapterPhase::Resetting, Some(reset)) => reset.from.starter_applied(),
            (phase, _) => phase.starter_applied(),
        }
    }

    /// Equality ignoring the revision counter.
    pub fn same_state(&self, other: &ProgressRecord) -> bool {
        self.chapter == other.chapter
            && self.phase == other.phase
            && self.resets == other.resets
            && self.reset == other.reset
            && self.pins == other.pins
    }
}

/// Forge-side state of an issue or pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Open,
    Closed,
    Merged,
}

/// One issue or pull request as seen on the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub number: u64,
    pub state: ArtifactState,
    pub labels: Vec<String>,
}

impl Sighting {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_open(&self) -> bool {
        self.state == ArtifactState::Open
    }
}

/// Snapshot of the forge for the current chapter. Recomputed every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObservation {
    pub issue: Option<Sighting>,
    pub starter_pr: Option<Sighting>,
    pub reset_pr: Option<Sighting>,
    pub default_head: String,
    pub learner_head: String,
}

/// Snapshot of the local working copy. Recomputed every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObservation {
    pub head: String,
    pub dirty: bool,
    /// Local commits not on the learner's upstream branch.
    pub ahead: u32,
    /// Upstream commits not yet in the local branch.
    pub behind: u32,
}

/// Classification of the learner's local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictVerdict {
    Clean,
    /// Edits confined to the game area.
    GameAreaOnly,
    /// Edits touch protected starter code.
    Drifted,
}

impl ConflictVerdict {
    /// True when forward progression may proceed.
    pub fn is_safe(self) -> bool {
        !matches!(self, ConflictVerdict::Drifted)
    }
}

/// Where a published branch's path comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSource {
    pub path: String,
    pub source_ref: String,
}

/// Content of a branch published for a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BranchContent {
    /// Base tree with the listed paths replaced by their source content.
    Overlay { paths: Vec<PathSource> },
    /// Entire tree of the given ref.
    Tree { source_ref: String },
}

/// An issue the dispatcher should make exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDraft {
    pub key: ArtifactKey,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// A pull request the dispatcher should make exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullDraft {
    pub key: ArtifactKey,
    /// Head branch to publish.
    pub head: String,
    /// Branch the PR targets.
    pub base_branch: String,
    /// Commit the head branch is built on.
    pub base_commit: String,
    pub content: BranchContent,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Side effect decided by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    FileIssue(IssueDraft),
    OpenStarterPr(PullDraft),
    FileResetPr(PullDraft),
    /// Label a completed chapter's issue.
    MarkCompleted { issue: u64 },
    /// Close a chapter issue solved by the reference solution.
    CloseIssue { issue: u64 },
    /// Rewrite protected paths in the working copy from their source refs.
    /// Used when a merged reset cannot fix drift that never left the machine.
    RestoreWorkingCopy { paths: Vec<PathSource> },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::FileIssue(_) => "file_issue",
            Action::OpenStarterPr(_) => "open_starter_pr",
            Action::FileResetPr(_) => "file_reset_pr",
            Action::MarkCompleted { .. } => "mark_completed",
            Action::CloseIssue { .. } => "close_issue",
            Action::RestoreWorkingCopy { .. } => "restore_working_copy",
        }
    }

    pub fn is_hard_reset(&self) -> bool {
        matches!(
            self,
            Action::FileResetPr(_) | Action::RestoreWorkingCopy { .. }
        )
    }
}

/// What a quiet decision is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wait {
    /// Filed issue not yet visible on the forge.
    IssueVisibility,
    StarterMerge,
    IssueClose,
    ResetMerge,
    /// Reset merged remotely; learner has not pulled it yet.
    LocalSync,
    /// Protected paths restored in the working copy; the next poll re-checks.
    LocalRestore,
    QuestFinished,
}

/// Remote state the machine refuses to act on automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// Starter PR was closed without merging.
    StarterPrClosed { number: u64 },
    /// Persisted chapter index is outside the quest.
    ChapterOutOfRange { chapter: usize, chapters: usize },
}

/// Output of one reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Revision of the record this decision was computed from.
    pub based_on: u64,
    /// Record to persist. Its revision is still `based_on`; the dispatcher bumps it.
    pub next: ProgressRecord,
    /// Phases entered, in order.
    pub path: Vec<ChapterPhase>,
    pub actions: Vec<Action>,
    pub wait: Option<Wait>,
    pub blocker: Option<Blocker>,
}

impl Decision {
    /// A decision that keeps `record` as is.
    pub fn hold(record: &ProgressRecord) -> Self {
        Self {
            based_on: record.revision,
            next: record.clone(),
            path: Vec::new(),
            actions: Vec::new(),
            wait: None,
            blocker: None,
        }
    }

    /// Move the next record into `phase`.
    pub fn enter(&mut self, phase: ChapterPhase) {
        self.next.phase = phase;
        self.path.push(phase);
    }

    pub fn waiting(mut self, wait: Wait) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn blocked(mut self, blocker: Blocker) -> Self {
        self.blocker = Some(blocker);
        self
    }

    /// True when applying this decision changes anything.
    pub fn is_change(&self, current: &ProgressRecord) -> bool {
        !self.actions.is_empty() || !self.next.same_state(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_applied_looks_through_resetting() {
        let record = ProgressRecord {
            phase: ChapterPhase::Resetting,
            reset: Some(ResetState {
                reason: ResetReason::Drift,
                from: ChapterPhase::InProgress,
                attempt: 1,
            }),
            ..ProgressRecord::default()
        };
        assert!(record.starter_applied());

        let early = ProgressRecord {
            reset: Some(ResetState {
                reason: ResetReason::Drift,
                from: ChapterPhase::StarterAvailable,
                attempt: 1,
            }),
            ..record
        };
        assert!(!early.starter_applied());
    }

    /// Persisted records must stay readable across releases.
    #[test]
    fn progress_record_serializes_to_stable_json() {
        let json = serde_json::to_string(&ProgressRecord::default()).expect("serialize");
        assert_eq!(
            json,
            "{\"chapter\":0,\"phase\":\"not_started\",\"revision\":0,\"resets\":0,\"reset\":null,\
             \"pins\":{\"issue\":null,\"starter_pr\":null,\"reset_pr\":null}}"
        );
    }

    #[test]
    fn progress_record_tolerates_missing_optional_fields() {
        let record: ProgressRecord =
            serde_json::from_str("{\"chapter\":2,\"phase\":\"in_progress\",\"revision\":7}")
                .expect("parse");
        assert_eq!(record.chapter, 2);
        assert_eq!(record.resets, 0);
        assert_eq!(record.pins, ArtifactPins::default());
    }

    #[test]
    fn hold_is_not_a_change() {
        let record = ProgressRecord::default();
        let decision = Decision::hold(&record);
        assert!(!decision.is_change(&record));
    }
}
