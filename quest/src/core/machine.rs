//! Quest progression state machine.
//!
//! `decide` is a pure function of the persisted record and the cycle's fresh
//! observations. It never performs I/O and never fails: conditions it refuses
//! to act on come back as a [`Blocker`] inside the [`Decision`].

use crate::core::identity::{
    ArtifactKey, ArtifactKind, COMPLETED_LABEL, RESET_LABEL, STARTER_LABEL, chapter_label,
};
use crate::core::types::{
    Action, ArtifactState, Blocker, BranchContent, ChapterPhase, ConflictVerdict, Decision,
    IssueDraft, LocalObservation, PathSource, ProgressRecord, PullDraft, RemoteObservation,
    ResetReason, ResetState, Sighting, Wait,
};
use crate::quest::{Chapter, Quest};

/// Upper bound on phase transitions chained within one decision.
const MAX_STEPS: usize = 8;

/// Everything one decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct MachineInput<'a> {
    pub instance_id: &'a str,
    pub quest: &'a Quest,
    pub record: &'a ProgressRecord,
    pub remote: &'a RemoteObservation,
    pub local: &'a LocalObservation,
    pub verdict: ConflictVerdict,
    /// Branch starter and reset pull requests target.
    pub learner_branch: &'a str,
}

/// Why a reference-solution request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("the quest is already finished")]
    QuestFinished,
    #[error("a hard reset is already pending{}", pending_suffix(.number))]
    ResetPending { number: Option<u64> },
    #[error("chapter index {chapter} is outside the quest ({chapters} chapters)")]
    ChapterOutOfRange { chapter: usize, chapters: usize },
}

fn pending_suffix(number: &Option<u64>) -> String {
    number.map(|n| format!(" (#{n})")).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Compute the next record and the actions needed to reach it.
pub fn decide(input: &MachineInput<'_>) -> Decision {
    let record = input.record;
    let mut decision = Decision::hold(record);

    if record.phase == ChapterPhase::Finished {
        return decision.waiting(Wait::QuestFinished);
    }
    let chapters = input.quest.chapters.len();
    if record.chapter >= chapters {
        return decision.blocked(Blocker::ChapterOutOfRange {
            chapter: record.chapter,
            chapters,
        });
    }

    if input.verdict == ConflictVerdict::Drifted {
        on_drift(input, &mut decision);
        return decision;
    }

    for _ in 0..MAX_STEPS {
        if step(input, &mut decision) == Flow::Stop {
            break;
        }
    }
    decision
}

/// Force a hard reset that delivers the chapter's reference solution.
///
/// Falls back to restoring the last applied starter when the chapter has no
/// solution. Ignores the conflict verdict.
pub fn decide_reference_solution(input: &MachineInput<'_>) -> Result<Decision, Refusal> {
    let record = input.record;
    if record.phase == ChapterPhase::Finished {
        return Err(Refusal::QuestFinished);
    }
    let chapters = input.quest.chapters.len();
    let Some(chapter) = input.quest.chapter(record.chapter) else {
        return Err(Refusal::ChapterOutOfRange {
            chapter: record.chapter,
            chapters,
        });
    };
    if record.phase == ChapterPhase::Resetting && reset_pending(input.remote.reset_pr.as_ref()) {
        return Err(Refusal::ResetPending {
            number: input.remote.reset_pr.as_ref().map(|pr| pr.number),
        });
    }

    let (reason, source_ref) = match &chapter.solution {
        Some(solution) => (ResetReason::ReferenceSolution, solution.git_ref.clone()),
        None => (
            ResetReason::StarterRestore,
            input
                .quest
                .applied_baseline(record.chapter, record.starter_applied())
                .to_string(),
        ),
    };

    let mut decision = Decision::hold(record);
    file_reset(
        input,
        &mut decision,
        reason,
        resume_phase(record),
        BranchContent::Tree { source_ref },
    );
    Ok(decision)
}

fn step(input: &MachineInput<'_>, decision: &mut Decision) -> Flow {
    match decision.next.phase {
        ChapterPhase::NotStarted => {
            let draft = issue_draft(input, decision.next.chapter);
            decision.enter(ChapterPhase::IssueFiled);
            decision.actions.push(Action::FileIssue(draft));
            Flow::Stop
        }
        ChapterPhase::IssueFiled => issue_filed(input, decision),
        ChapterPhase::StarterAvailable => starter_available(input, decision),
        ChapterPhase::InProgress => match &input.remote.issue {
            Some(issue) if issue.state != ArtifactState::Open => {
                complete_chapter(input, decision);
                Flow::Stop
            }
            _ => {
                decision.wait = Some(Wait::IssueClose);
                Flow::Stop
            }
        },
        ChapterPhase::Completed => {
            complete_chapter(input, decision);
            Flow::Stop
        }
        ChapterPhase::Resetting => resetting(input, decision),
        ChapterPhase::Finished => {
            decision.wait = Some(Wait::QuestFinished);
            Flow::Stop
        }
    }
}

fn issue_filed(input: &MachineInput<'_>, decision: &mut Decision) -> Flow {
    if input.remote.issue.is_none() {
        decision.wait = Some(Wait::IssueVisibility);
        return Flow::Stop;
    }
    let chapter = current_chapter(input, decision);
    match chapter.and_then(|ch| ch.starter.as_ref()) {
        Some(_) => {
            let draft = starter_draft(input, decision.next.chapter);
            decision.enter(ChapterPhase::StarterAvailable);
            if let Some(draft) = draft {
                decision.actions.push(Action::OpenStarterPr(draft));
            }
            Flow::Stop
        }
        None => {
            decision.enter(ChapterPhase::InProgress);
            Flow::Continue
        }
    }
}

fn starter_available(input: &MachineInput<'_>, decision: &mut Decision) -> Flow {
    let has_starter = current_chapter(input, decision).is_some_and(|ch| ch.starter.is_some());
    if !has_starter {
        decision.enter(ChapterPhase::InProgress);
        return Flow::Continue;
    }
    match &input.remote.starter_pr {
        Some(pr) if pr.state == ArtifactState::Merged => {
            decision.enter(ChapterPhase::InProgress);
            Flow::Continue
        }
        Some(pr) if pr.state == ArtifactState::Closed => {
            decision.blocker = Some(Blocker::StarterPrClosed { number: pr.number });
            Flow::Stop
        }
        _ => {
            decision.wait = Some(Wait::StarterMerge);
            Flow::Stop
        }
    }
}

fn resetting(input: &MachineInput<'_>, decision: &mut Decision) -> Flow {
    let reason = decision.next.reset.map(|reset| reset.reason);
    match &input.remote.reset_pr {
        pr if reset_pending(pr.as_ref()) && reason.is_some() => {
            decision.wait = Some(Wait::ResetMerge);
            Flow::Stop
        }
        Some(pr) if pr.state == ArtifactState::Merged && input.local.behind > 0 => {
            decision.wait = Some(Wait::LocalSync);
            Flow::Stop
        }
        Some(pr) if pr.state == ArtifactState::Merged => {
            rederive(input, decision);
            if reason == Some(ResetReason::ReferenceSolution)
                && let Some(issue) = input.remote.issue.as_ref().filter(|issue| issue.is_open())
            {
                decision.actions.push(Action::CloseIssue {
                    issue: issue.number,
                });
                return Flow::Stop;
            }
            Flow::Continue
        }
        _ => {
            rederive(input, decision);
            Flow::Continue
        }
    }
}

/// Drift preempts everything except an in-flight reset.
fn on_drift(input: &MachineInput<'_>, decision: &mut Decision) {
    let record = input.record;
    if record.phase == ChapterPhase::Resetting
        && let Some(reset) = record.reset
    {
        match &input.remote.reset_pr {
            pr if reset_pending(pr.as_ref()) => {
                decision.wait = Some(Wait::ResetMerge);
                return;
            }
            Some(pr) if pr.state == ArtifactState::Merged && input.local.behind > 0 => {
                decision.wait = Some(Wait::LocalSync);
                return;
            }
            Some(pr) if pr.state == ArtifactState::Merged => {
                // The merged reset is in the working copy, so what remains is
                // local-only: uncommitted or unpushed edits no PR can reach.
                let paths = drift_paths(input, reset.from.starter_applied());
                decision.actions.push(Action::RestoreWorkingCopy { paths });
                decision.wait = Some(Wait::LocalRestore);
                return;
            }
            _ => {
                let content = drift_content(input, reset.from.starter_applied());
                file_reset(input, decision, ResetReason::Drift, reset.from, content);
                return;
            }
        }
    }

    let from = resume_phase(record);
    let content = drift_content(input, record.starter_applied());
    file_reset(input, decision, ResetReason::Drift, from, content);
}

fn complete_chapter(input: &MachineInput<'_>, decision: &mut Decision) {
    decision.enter(ChapterPhase::Completed);
    if let Some(issue) = &input.remote.issue
        && !issue.has_label(COMPLETED_LABEL)
    {
        decision.actions.push(Action::MarkCompleted {
            issue: issue.number,
        });
    }

    if input.quest.is_last(decision.next.chapter) {
        decision.enter(ChapterPhase::Finished);
        decision.wait = Some(Wait::QuestFinished);
        return;
    }

    decision.next.chapter += 1;
    decision.next.resets = 0;
    decision.next.reset = None;
    decision.next.pins = Default::default();
    decision.enter(ChapterPhase::NotStarted);
}

/// Return to the phase the current chapter's observations support.
fn rederive(input: &MachineInput<'_>, decision: &mut Decision) {
    decision.next.reset = None;
    decision.next.pins.reset_pr = None;

    let remote = input.remote;
    let has_starter = current_chapter(input, decision).is_some_and(|ch| ch.starter.is_some());
    let starter_merged = remote
        .starter_pr
        .as_ref()
        .is_some_and(|pr| pr.state == ArtifactState::Merged);

    let phase = if remote.issue.is_none() && decision.next.pins.issue.is_none() {
        ChapterPhase::NotStarted
    } else if has_starter && !starter_merged {
        if remote.starter_pr.is_some() {
            ChapterPhase::StarterAvailable
        } else {
            ChapterPhase::IssueFiled
        }
    } else {
        ChapterPhase::InProgress
    };
    decision.enter(phase);
}

fn file_reset(
    input: &MachineInput<'_>,
    decision: &mut Decision,
    reason: ResetReason,
    from: ChapterPhase,
    content: BranchContent,
) {
    let attempt = decision.next.resets + 1;
    decision.next.resets = attempt;
    decision.next.reset = Some(ResetState {
        reason,
        from,
        attempt,
    });
    decision.next.pins.reset_pr = None;
    decision.enter(ChapterPhase::Resetting);

    let chapter_index = decision.next.chapter;
    let key = ArtifactKey::new(
        input.instance_id,
        chapter_index,
        ArtifactKind::ResetPr { attempt },
    );
    let title_suffix = input
        .quest
        .chapter(chapter_index)
        .map(|ch| ch.title.as_str())
        .unwrap_or_default();
    let number = chapter_index + 1;
    let (title, body) = match reason {
        ResetReason::Drift => (
            format!("Hard reset: restore protected code for chapter {number}"),
            format!(
                "Edits outside the game area changed code that later chapters depend on.\n\n\
                 Merging this pull request restores the protected files below and keeps \
                 everything else as it is:\n\n{}",
                bullet_paths(&content)
            ),
        ),
        ResetReason::ReferenceSolution => (
            format!("Reference solution for chapter {number}: {title_suffix}"),
            "Merging this pull request replaces the repository with the chapter's \
             reference solution. The chapter issue is closed once it lands."
                .to_string(),
        ),
        ResetReason::StarterRestore => (
            format!("Hard reset: restore the starter state of chapter {number}"),
            "This chapter has no reference solution. Merging this pull request restores \
             the repository to the chapter's starting point."
                .to_string(),
        ),
    };

    decision.actions.push(Action::FileResetPr(PullDraft {
        head: key.branch(),
        base_branch: input.learner_branch.to_string(),
        base_commit: input.remote.learner_head.clone(),
        content,
        title,
        body,
        labels: vec![
            key.label().to_string(),
            RESET_LABEL.to_string(),
            chapter_label(chapter_index),
        ],
        key,
    }));
}

fn issue_draft(input: &MachineInput<'_>, chapter_index: usize) -> IssueDraft {
    let key = ArtifactKey::new(input.instance_id, chapter_index, ArtifactKind::ChapterIssue);
    let (title, body) = input
        .quest
        .chapter(chapter_index)
        .map(|ch| (ch.title.clone(), ch.issue_body.clone()))
        .unwrap_or_default();
    IssueDraft {
        labels: vec![key.label().to_string(), chapter_label(chapter_index)],
        key,
        title,
        body,
    }
}

fn starter_draft(input: &MachineInput<'_>, chapter_index: usize) -> Option<PullDraft> {
    let chapter = input.quest.chapter(chapter_index)?;
    let starter = chapter.starter.as_ref()?;
    let key = ArtifactKey::new(input.instance_id, chapter_index, ArtifactKind::StarterPr);
    let paths = starter
        .protected
        .iter()
        .map(|path| PathSource {
            path: path.clone(),
            source_ref: starter.git_ref.clone(),
        })
        .collect();
    Some(PullDraft {
        head: key.branch(),
        base_branch: input.learner_branch.to_string(),
        base_commit: input.remote.learner_head.clone(),
        content: BranchContent::Overlay { paths },
        title: format!("Starter code: {}", chapter.title),
        body: format!(
            "Starter code for chapter {}. Merge this pull request to begin.",
            chapter_index + 1
        ),
        labels: vec![
            key.label().to_string(),
            STARTER_LABEL.to_string(),
            chapter_label(chapter_index),
        ],
        key,
    })
}

fn drift_content(input: &MachineInput<'_>, starter_applied: bool) -> BranchContent {
    BranchContent::Overlay {
        paths: drift_paths(input, starter_applied),
    }
}

fn drift_paths(input: &MachineInput<'_>, starter_applied: bool) -> Vec<PathSource> {
    input
        .quest
        .effective_manifest(input.record.chapter, starter_applied)
        .into_iter()
        .map(|(path, source_ref)| PathSource { path, source_ref })
        .collect()
}

fn bullet_paths(content: &BranchContent) -> String {
    match content {
        BranchContent::Overlay { paths } => paths
            .iter()
            .map(|source| format!("- `{}`", source.path))
            .collect::<Vec<_>>()
            .join("\n"),
        BranchContent::Tree { source_ref } => format!("- everything from `{source_ref}`"),
    }
}

fn current_chapter<'q>(input: &MachineInput<'q>, decision: &Decision) -> Option<&'q Chapter> {
    input.quest.chapter(decision.next.chapter)
}

/// Phase a reset resumes from, looking through an in-flight reset.
fn resume_phase(record: &ProgressRecord) -> ChapterPhase {
    match (record.phase, record.reset) {
        (ChapterPhase::Resetting, Some(reset)) => reset.from,
        (ChapterPhase::Resetting, None) => ChapterPhase::NotStarted,
        (phase, _) => phase,
    }
}

/// A reset PR that is open, or filed but not visible yet.
fn reset_pending(pr: Option<&Sighting>) -> bool {
    pr.is_none_or(Sighting::is_open)
}
