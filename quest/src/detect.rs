//! Gathers protected-file content for conflict classification.
//!
//! Reads expected content from the refs named in the effective manifest and
//! actual content from the working tree, then hands both to the pure
//! classifier in [`crate::core::conflict`]. Never touches the network.

use tracing::{debug, instrument};

use crate::core::conflict::{ConflictPolicy, ConflictReport, FileComparison, classify};
use crate::core::types::{LocalObservation, ProgressRecord};
use crate::error::CycleError;
use crate::io::git::{FileAt, LocalGit};
use crate::quest::Quest;

/// Classify the learner's edits for the record's current chapter.
///
/// Failures abort the cycle; an unreadable file is never taken as drift.
#[instrument(skip_all, fields(chapter = record.chapter))]
pub fn evaluate<G: LocalGit + ?Sized>(
    git: &G,
    quest: &Quest,
    record: &ProgressRecord,
    local: &LocalObservation,
    policy: &ConflictPolicy,
) -> Result<ConflictReport, CycleError> {
    let manifest = quest.effective_manifest(record.chapter, record.starter_applied());
    let mut files = Vec::with_capacity(manifest.len());
    for (path, source_ref) in manifest {
        let expected = git
            .read_file(&path, FileAt::Rev(&source_ref))
            .map_err(|err| CycleError::local(&format!("read {path} at {source_ref}"), err))?;
        let actual = git
            .read_file(&path, FileAt::WorkTree)
            .map_err(|err| CycleError::local(&format!("read {path} from working tree"), err))?;
        files.push(FileComparison {
            path,
            expected,
            actual,
        });
    }

    let report = classify(&files, local, policy);
    debug!(
        verdict = ?report.verdict,
        files = files.len(),
        drifted = ?report.drifted_paths,
        "conflict evaluated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChapterPhase, ConflictVerdict};
    use crate::test_support::{FakeGit, chapter_with_starter, quest_with};

    const STARTER: &str =
        "pub fn api() {}\n// quest:game-area:begin\n// your code\n// quest:game-area:end\n";

    fn setup() -> (FakeGit, Quest) {
        let git = FakeGit::new();
        git.set_file("upstream/one", "src/lib.rs", STARTER);
        git.set_worktree_file("src/lib.rs", STARTER);
        let quest = quest_with(vec![
            chapter_with_starter("one", "upstream/one", &["src/lib.rs"]),
            chapter_with_starter("two", "upstream/two", &["src/net.rs"]),
        ]);
        (git, quest)
    }

    fn evaluate_clean_local(
        git: &FakeGit,
        quest: &Quest,
        record: &ProgressRecord,
    ) -> Result<ConflictReport, CycleError> {
        evaluate(git, quest, record, &LocalObservation::default(), &ConflictPolicy::default())
    }

    fn in_progress(chapter: usize) -> ProgressRecord {
        ProgressRecord {
            chapter,
            phase: ChapterPhase::InProgress,
            ..ProgressRecord::default()
        }
    }

    #[test]
    fn untouched_starter_is_clean() {
        let (git, quest) = setup();
        let report = evaluate_clean_local(&git, &quest, &in_progress(0)).expect("evaluate");
        assert_eq!(report.verdict, ConflictVerdict::Clean);
    }

    #[test]
    fn protected_edit_is_drift() {
        let (git, quest) = setup();
        git.set_worktree_file("src/lib.rs", &STARTER.replace("api", "apx"));
        let report = evaluate_clean_local(&git, &quest, &in_progress(0)).expect("evaluate");
        assert_eq!(report.verdict, ConflictVerdict::Drifted);
        assert_eq!(report.drifted_paths, vec!["src/lib.rs".to_string()]);
    }

    /// Files of a starter that has not landed yet are not checked.
    #[test]
    fn unapplied_starter_paths_are_ignored() {
        let (git, quest) = setup();
        let record = ProgressRecord {
            chapter: 1,
            phase: ChapterPhase::StarterAvailable,
            ..ProgressRecord::default()
        };
        let report = evaluate_clean_local(&git, &quest, &record).expect("evaluate");
        assert_eq!(report.verdict, ConflictVerdict::Clean);
    }

    #[test]
    fn unreadable_ref_aborts_instead_of_drifting() {
        let (git, quest) = setup();
        let err = evaluate_clean_local(&git, &quest, &in_progress(1))
            .expect_err("upstream/two is unknown");
        assert!(matches!(err, CycleError::LocalUnavailable(_)));
    }
}
