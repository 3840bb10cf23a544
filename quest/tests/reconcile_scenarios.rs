//! End-to-end reconciliation scenarios over in-memory capabilities.
//!
//! Each test drives `run_cycle` repeatedly while mutating the fake forge and
//! working copy the way a learner would, and checks the persisted record and
//! forge side effects after every poll.

use quest::core::identity::{ArtifactKey, ArtifactKind, COMPLETED_LABEL, RESET_LABEL};
use quest::core::types::{
    ArtifactPins, ArtifactState, BranchContent, ChapterPhase, ConflictVerdict, ProgressRecord,
    ResetReason, Wait,
};
use quest::error::CycleError;
use quest::io::config::QuestConfig;
use quest::io::git::{FileAt, LocalGit};
use quest::poll::{Cancellation, CycleContext, CycleReport, Intent, run_cycle};
use quest::quest::{Quest, Solution};
use quest::test_support::{
    FakeForge, FakeGit, ForgeFailure, MemoryProgressStore, chapter, chapter_with_starter,
    quest_with,
};

const ID: &str = "rq";
const SERVER_STARTER: &str = "use std::net::TcpListener;\n\
pub fn bind() -> TcpListener {\n    TcpListener::bind(\"127.0.0.1:0\").unwrap()\n}\n\
// quest:game-area:begin\n\
pub fn handle() {}\n\
// quest:game-area:end\n";

struct World {
    quest: Quest,
    config: QuestConfig,
    forge: FakeForge,
    git: FakeGit,
    store: MemoryProgressStore,
}

impl World {
    fn new() -> Self {
        let git = FakeGit::new();
        git.set_file("upstream/server", "src/server.rs", SERVER_STARTER);
        git.set_worktree_file("src/server.rs", SERVER_STARTER);
        Self {
            quest: quest_with(vec![
                chapter("basics"),
                chapter_with_starter("server", "upstream/server", &["src/server.rs"]),
            ]),
            config: QuestConfig::default(),
            forge: FakeForge::new(),
            git,
            store: MemoryProgressStore::new(),
        }
    }

    fn run(&self, intent: Intent) -> Result<CycleReport, CycleError> {
        let ctx = CycleContext {
            instance_id: ID,
            quest: &self.quest,
            config: &self.config,
            forge: &self.forge,
            git: &self.git,
            store: &self.store,
        };
        run_cycle(&ctx, intent, &Cancellation::new())
    }

    fn poll(&self) -> CycleReport {
        self.run(Intent::Reconcile).expect("poll")
    }

    fn record(&self) -> ProgressRecord {
        self.store.current(ID).unwrap_or_default()
    }

    /// Chapter 2 in progress: issue open, starter merged.
    fn seed_server_in_progress(&self) -> (u64, u64) {
        let issue_key = ArtifactKey::new(ID, 1, ArtifactKind::ChapterIssue);
        let starter_key = ArtifactKey::new(ID, 1, ArtifactKind::StarterPr);
        let issue = self.forge.open_issue_with_labels(&[issue_key.label()]);
        let starter = self.forge.open_pull_with_labels(&[starter_key.label()]);
        self.forge.merge_remote(starter);
        self.store.seed(ID, ProgressRecord {
            chapter: 1,
            phase: ChapterPhase::InProgress,
            revision: 7,
            resets: 0,
            reset: None,
            pins: ArtifactPins {
                issue: Some(issue),
                starter_pr: Some(starter),
                reset_pr: None,
            },
        });
        (issue, starter)
    }
}

#[test]
fn chapters_advance_from_issue_to_finish() {
    let world = World::new();
    let mut chapters_seen = Vec::new();

    let filed = world.poll();
    assert_eq!(filed.record.phase, ChapterPhase::IssueFiled);
    let issue = filed.record.pins.issue.expect("issue pinned");
    chapters_seen.push(filed.record.chapter);

    let started = world.poll();
    assert_eq!(started.record.phase, ChapterPhase::InProgress);
    assert_eq!(started.decision.wait, Some(Wait::IssueClose));

    let quiet = world.poll();
    assert!(!quiet.persisted, "nothing changed remotely");
    assert_eq!(quiet.record, started.record);

    world.forge.close_remote(issue);
    let advanced = world.poll();
    assert_eq!(advanced.record.chapter, 1);
    assert_eq!(advanced.record.phase, ChapterPhase::NotStarted);
    assert_eq!(advanced.record.pins, ArtifactPins::default());
    assert!(world.forge.issue(issue).expect("issue").has_label(COMPLETED_LABEL));
    chapters_seen.push(advanced.record.chapter);

    // Chapter 2 has starter code: issue, then starter pull request.
    let second_issue = world.poll().record.pins.issue.expect("second issue");
    let offered = world.poll();
    assert_eq!(offered.record.phase, ChapterPhase::StarterAvailable);
    let starter = offered.record.pins.starter_pr.expect("starter pinned");
    let published = world.git.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].branch, "quest/rq/chapter-2-starter");
    assert_eq!(published[0].base, "main-head");
    assert!(matches!(
        &published[0].content,
        BranchContent::Overlay { paths }
            if paths.len() == 1 && paths[0].source_ref == "upstream/server"
    ));

    let waiting = world.poll();
    assert_eq!(waiting.decision.wait, Some(Wait::StarterMerge));
    assert!(!waiting.persisted);

    world.forge.merge_remote(starter);
    let working = world.poll();
    assert_eq!(working.record.phase, ChapterPhase::InProgress);
    assert_eq!(working.conflict.verdict, ConflictVerdict::Clean);

    world.forge.close_remote(second_issue);
    let finished = world.poll();
    assert_eq!(finished.record.phase, ChapterPhase::Finished);
    assert_eq!(finished.record.chapter, 1);
    chapters_seen.push(finished.record.chapter);

    let after = world.poll();
    assert_eq!(after.decision.wait, Some(Wait::QuestFinished));
    assert!(!after.persisted);
    assert!(chapters_seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(world.forge.issue_count(), 2);
    assert_eq!(world.forge.pull_count(), 1);
}

#[test]
fn drift_files_one_reset_and_rederives_after_sync() {
    let world = World::new();
    let (issue, _) = world.seed_server_in_progress();
    world
        .git
        .set_worktree_file("src/server.rs", &SERVER_STARTER.replace("127.0.0.1", "0.0.0.0"));

    let reset = world.poll();
    assert_eq!(reset.conflict.verdict, ConflictVerdict::Drifted);
    assert_eq!(reset.record.phase, ChapterPhase::Resetting);
    assert_eq!(reset.record.resets, 1);
    assert_eq!(reset.record.reset.map(|r| r.reason), Some(ResetReason::Drift));
    let reset_pr = reset.record.pins.reset_pr.expect("reset pinned");
    assert!(world.forge.pull(reset_pr).expect("pr").has_label(RESET_LABEL));
    assert_eq!(world.git.published()[0].branch, "quest/rq/chapter-2-reset-1");

    // Polling again while the reset is open files nothing new.
    let repoll = world.poll();
    assert_eq!(repoll.decision.wait, Some(Wait::ResetMerge));
    assert!(!repoll.persisted);
    assert_eq!(world.forge.pull_count(), 2);

    // Merged remotely but not pulled yet.
    world.forge.merge_remote(reset_pr);
    world.git.set_ahead_behind(0, 1);
    let syncing = world.poll();
    assert_eq!(syncing.decision.wait, Some(Wait::LocalSync));
    assert_eq!(world.forge.pull_count(), 2);

    world.git.set_ahead_behind(0, 0);
    world.git.set_worktree_file("src/server.rs", SERVER_STARTER);
    let resumed = world.poll();
    assert_eq!(resumed.conflict.verdict, ConflictVerdict::Clean);
    assert_eq!(resumed.record.phase, ChapterPhase::InProgress);
    assert_eq!(resumed.record.reset, None);
    assert_eq!(resumed.record.pins.reset_pr, None);
    assert_eq!(resumed.record.pins.issue, Some(issue));
    assert_eq!(resumed.record.chapter, 1, "a reset never moves the chapter");
}

/// Uncommitted drift survives a merged reset; it is restored locally instead
/// of filing (and auto-merging) a new reset on every poll.
#[test]
fn uncommitted_drift_after_merged_reset_is_restored_locally() {
    let mut world = World::new();
    world.config.forge.auto_merge_resets = true;
    let (issue, _) = world.seed_server_in_progress();
    let solved = SERVER_STARTER.replace("pub fn handle() {}", "pub fn handle() { serve() }");
    world
        .git
        .set_worktree_file("src/server.rs", &solved.replace("127.0.0.1", "0.0.0.0"));
    world.git.set_dirty(true);

    let reset = world.poll();
    let reset_pr = reset.record.pins.reset_pr.expect("reset pinned");
    assert_eq!(world.forge.pull(reset_pr).map(|pr| pr.state), Some(ArtifactState::Merged));

    let restored = world.poll();
    assert_eq!(restored.conflict.verdict, ConflictVerdict::Drifted);
    assert_eq!(restored.decision.wait, Some(Wait::LocalRestore));
    assert_eq!(restored.record.phase, ChapterPhase::Resetting);
    assert_eq!(restored.record.resets, 1);
    assert_eq!(
        world.git.read_file("src/server.rs", FileAt::WorkTree).expect("read"),
        Some(solved.clone()),
        "protected text restored, game area kept"
    );

    let resumed = world.poll();
    assert_eq!(resumed.conflict.verdict, ConflictVerdict::GameAreaOnly);
    assert_eq!(resumed.record.phase, ChapterPhase::InProgress);
    assert_eq!(resumed.record.pins.issue, Some(issue));

    for _ in 0..5 {
        let quiet = world.poll();
        assert!(!quiet.persisted);
        assert_eq!(quiet.record.phase, ChapterPhase::InProgress);
    }
    assert_eq!(world.forge.pull_count(), 2, "starter plus a single reset");
    assert_eq!(world.git.published().len(), 1);
}

#[test]
fn game_area_edits_never_reset() {
    let world = World::new();
    world.seed_server_in_progress();
    let edited = SERVER_STARTER.replace(
        "pub fn handle() {}",
        "pub fn handle() {\n    println!(\"hi\");\n}",
    );
    world.git.set_worktree_file("src/server.rs", &edited);
    world.git.set_dirty(true);

    let report = world.poll();
    assert_eq!(report.conflict.verdict, ConflictVerdict::GameAreaOnly);
    assert!(!report.decision.actions.iter().any(|action| action.is_hard_reset()));
    assert_eq!(world.forge.pull_count(), 1);
}

#[test]
fn closed_reset_with_drift_left_files_next_attempt() {
    let world = World::new();
    world.seed_server_in_progress();
    world.git.set_worktree_file("src/server.rs", "// gone\n");
    let first = world.poll().record.pins.reset_pr.expect("first reset");

    world.forge.close_remote(first);
    let second = world.poll();
    assert_eq!(second.record.resets, 2);
    let pinned = second.record.pins.reset_pr.expect("second reset");
    assert_ne!(pinned, first);
    assert_eq!(world.git.published()[1].branch, "quest/rq/chapter-2-reset-2");
}

#[test]
fn remote_timeout_leaves_record_untouched_and_next_poll_recovers() {
    let world = World::new();
    world.poll();
    let before = world.record();

    world.forge.fail_next(ForgeFailure::Unavailable);
    let err = world.run(Intent::Reconcile).expect_err("timeout");
    assert!(matches!(err, CycleError::RemoteUnavailable(_)));
    assert_eq!(world.record(), before);

    let recovered = world.poll();
    assert_eq!(recovered.record.phase, ChapterPhase::InProgress);
}

#[test]
fn unpersisted_issue_is_adopted_instead_of_duplicated() {
    let world = World::new();
    world.store.fail_next_save();
    let err = world.run(Intent::Reconcile).expect_err("save fails");
    assert!(matches!(err, CycleError::LocalUnavailable(_)));
    assert_eq!(world.forge.issue_count(), 1);
    assert_eq!(world.record(), ProgressRecord::default());

    let retried = world.poll();
    assert_eq!(world.forge.issue_count(), 1);
    assert_eq!(retried.record.phase, ChapterPhase::IssueFiled);
}

#[test]
fn issue_not_yet_searchable_waits_for_visibility() {
    let world = World::new();
    world.forge.hide_from_search(1);
    let filed = world.poll();
    let issue = filed.record.pins.issue.expect("pinned");

    // The pin finds it even while search lags.
    let next = world.poll();
    assert_eq!(next.record.phase, ChapterPhase::InProgress);
    assert_eq!(next.record.pins.issue, Some(issue));
    assert_eq!(world.forge.issue_count(), 1);
}

#[test]
fn reference_solution_resets_then_closes_the_issue() {
    let mut world = World::new();
    world.quest.chapters[0].solution = Some(Solution {
        git_ref: "upstream/basics-solution".to_string(),
    });
    world.poll();
    let in_progress = world.poll();
    let issue = in_progress.record.pins.issue.expect("issue");

    let requested = world.run(Intent::ReferenceSolution).expect("request");
    assert_eq!(requested.record.phase, ChapterPhase::Resetting);
    assert_eq!(
        requested.record.reset.map(|r| r.reason),
        Some(ResetReason::ReferenceSolution)
    );
    assert_eq!(
        world.git.published()[0].content,
        BranchContent::Tree {
            source_ref: "upstream/basics-solution".to_string()
        }
    );
    let reset_pr = requested.record.pins.reset_pr.expect("reset");

    let refused = world.run(Intent::ReferenceSolution).expect_err("pending");
    assert!(matches!(refused, CycleError::Refused(_)), "{refused:?}");

    world.forge.merge_remote(reset_pr);
    let landed = world.poll();
    assert_eq!(landed.record.phase, ChapterPhase::InProgress);
    assert_eq!(world.forge.issue(issue).map(|s| s.state), Some(ArtifactState::Closed));

    let advanced = world.poll();
    assert_eq!(advanced.record.chapter, 1);
}

#[test]
fn deleted_pinned_issue_is_reported_not_recreated() {
    let world = World::new();
    let issue = world.poll().record.pins.issue.expect("issue");
    world.forge.delete(issue);

    let err = world.run(Intent::Reconcile).expect_err("inconsistent");
    assert!(matches!(err, CycleError::RemoteInconsistent(_)));
    assert!(err.halts_polling());
    assert_eq!(world.forge.issue_count(), 0);
}

#[test]
fn closed_starter_pr_needs_attention() {
    let world = World::new();
    world.store.seed(ID, ProgressRecord {
        chapter: 1,
        phase: ChapterPhase::NotStarted,
        revision: 3,
        ..ProgressRecord::default()
    });
    world.poll();
    let starter = world.poll().record.pins.starter_pr.expect("starter");
    world.forge.close_remote(starter);

    let err = world.run(Intent::Reconcile).expect_err("blocked");
    assert!(matches!(err, CycleError::RemoteInconsistent(_)));
    assert_eq!(world.record().phase, ChapterPhase::StarterAvailable);
}
