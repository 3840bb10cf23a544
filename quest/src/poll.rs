//! One poll cycle: observe, classify, decide, dispatch.
//!
//! Reads and classification are recomputed from scratch on every attempt.
//! A cycle that loses a race (`ActionConflict`, `StaleRevision`) starts over
//! from fresh reads, up to `poll.max_recomputes` times.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, instrument, warn};

use crate::core::conflict::ConflictReport;
use crate::core::machine::{MachineInput, decide, decide_reference_solution};
use crate::core::types::{Blocker, Decision, ProgressRecord};
use crate::detect;
use crate::dispatch::{Dispatcher, Performed};
use crate::error::CycleError;
use crate::io::config::QuestConfig;
use crate::io::forge::Forge;
use crate::io::git::LocalGit;
use crate::io::progress_store::ProgressStore;
use crate::io::remote::{self, RemoteQuery};
use crate::io::local;
use crate::quest::Quest;

/// Remote whose tracking refs describe the learner's upstream.
pub const UPSTREAM_REMOTE: &str = "origin";

/// Cooperative cancellation shared between a cycle and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), CycleError> {
        if self.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        Ok(())
    }
}

/// Why the cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Normal reconciliation.
    Reconcile,
    /// The learner asked for the chapter's reference solution.
    ReferenceSolution,
}

/// Capabilities and settings one cycle runs against.
#[derive(Clone, Copy)]
pub struct CycleContext<'a> {
    pub instance_id: &'a str,
    pub quest: &'a Quest,
    pub config: &'a QuestConfig,
    pub forge: &'a dyn Forge,
    pub git: &'a dyn LocalGit,
    pub store: &'a dyn ProgressStore,
}

/// What a successful cycle saw and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Record after the cycle (persisted or unchanged).
    pub record: ProgressRecord,
    pub conflict: ConflictReport,
    pub decision: Decision,
    pub performed: Vec<Performed>,
    pub persisted: bool,
    /// Fresh recomputations after lost races.
    pub recomputes: u32,
}

/// Run one cycle for `intent`.
#[instrument(skip_all, fields(instance = ctx.instance_id, intent = ?intent))]
pub fn run_cycle(
    ctx: &CycleContext<'_>,
    intent: Intent,
    cancel: &Cancellation,
) -> Result<CycleReport, CycleError> {
    cancel.check()?;
    if ctx.config.poll.fetch {
        ctx.git
            .fetch()
            .map_err(|err| CycleError::RemoteUnavailable(format!("git fetch: {err:#}")))?;
    }

    let budget = ctx.config.poll.max_recomputes;
    let mut recomputes = 0;
    loop {
        cancel.check()?;
        match attempt(ctx, intent, cancel) {
            Ok(mut report) => {
                report.recomputes = recomputes;
                return Ok(report);
            }
            Err(err) if err.is_recomputable() && recomputes < budget => {
                recomputes += 1;
                info!(err = %err, recomputes, "recomputing from fresh reads");
            }
            Err(err) => {
                if err.is_recomputable() {
                    warn!(err = %err, "recompute budget exhausted");
                }
                return Err(err);
            }
        }
    }
}

fn attempt(
    ctx: &CycleContext<'_>,
    intent: Intent,
    cancel: &Cancellation,
) -> Result<CycleReport, CycleError> {
    let record = ctx
        .store
        .load_progress(ctx.instance_id)
        .map_err(|err| CycleError::LocalUnavailable(format!("load progress: {err}")))?
        .unwrap_or_default();

    let forge_cfg = &ctx.config.forge;
    let remote = remote::observe(
        ctx.forge,
        &RemoteQuery {
            instance_id: ctx.instance_id,
            quest: ctx.quest,
            record: &record,
            default_branch: &forge_cfg.default_branch,
            learner_branch: &forge_cfg.learner_branch,
            strict: intent == Intent::Reconcile,
        },
    )?;
    let upstream = format!("{UPSTREAM_REMOTE}/{}", forge_cfg.learner_branch);
    let local = local::observe(ctx.git, &upstream)?;
    let policy = ctx.config.conflict.policy();
    let conflict = detect::evaluate(ctx.git, ctx.quest, &record, &local, &policy)?;

    let input = MachineInput {
        instance_id: ctx.instance_id,
        quest: ctx.quest,
        record: &record,
        remote: &remote,
        local: &local,
        verdict: conflict.verdict,
        learner_branch: &forge_cfg.learner_branch,
    };
    let decision = match intent {
        Intent::Reconcile => decide(&input),
        Intent::ReferenceSolution => decide_reference_solution(&input)
            .map_err(|refusal| CycleError::Refused(refusal.to_string()))?,
    };
    if let Some(blocker) = &decision.blocker {
        return Err(blocker_error(blocker));
    }

    let outcome = Dispatcher {
        forge: ctx.forge,
        git: ctx.git,
        store: ctx.store,
        instance_id: ctx.instance_id,
        chapter_count: ctx.quest.chapters.len(),
        auto_merge_resets: forge_cfg.auto_merge_resets,
        policy: &policy,
    }
    .apply(&decision, cancel)?;

    Ok(CycleReport {
        record: outcome.record,
        conflict,
        decision,
        performed: outcome.performed,
        persisted: outcome.persisted,
        recomputes: 0,
    })
}

fn blocker_error(blocker: &Blocker) -> CycleError {
    match blocker {
        Blocker::StarterPrClosed { number } => CycleError::RemoteInconsistent(format!(
            "starter pull request #{number} was closed without merging; reopen and merge it"
        )),
        Blocker::ChapterOutOfRange { chapter, chapters } => CycleError::ActionFatal(format!(
            "recorded chapter {chapter} is outside the quest ({chapters} chapters)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChapterPhase, ConflictVerdict};
    use crate::test_support::{FakeForge, FakeGit, MemoryProgressStore, chapter, quest_with};

    struct World {
        quest: Quest,
        config: QuestConfig,
        forge: FakeForge,
        git: FakeGit,
        store: MemoryProgressStore,
    }

    impl World {
        fn new() -> Self {
            Self {
                quest: quest_with(vec![chapter("one"), chapter("two")]),
                config: QuestConfig::default(),
                forge: FakeForge::new(),
                git: FakeGit::new(),
                store: MemoryProgressStore::new(),
            }
        }

        fn ctx(&self) -> CycleContext<'_> {
            CycleContext {
                instance_id: "rq",
                quest: &self.quest,
                config: &self.config,
                forge: &self.forge,
                git: &self.git,
                store: &self.store,
            }
        }
    }

    #[test]
    fn first_cycle_files_the_chapter_issue() {
        let world = World::new();
        let report = run_cycle(&world.ctx(), Intent::Reconcile, &Cancellation::new())
            .expect("cycle");
        assert_eq!(report.record.phase, ChapterPhase::IssueFiled);
        assert_eq!(report.conflict.verdict, ConflictVerdict::Clean);
        assert_eq!(world.forge.issue_count(), 1);
        assert_eq!(world.git.fetch_count(), 1);
    }

    #[test]
    fn lost_race_is_recomputed_from_fresh_reads() {
        let world = World::new();
        world.store.interfere_next_save();
        let report = run_cycle(&world.ctx(), Intent::Reconcile, &Cancellation::new())
            .expect("cycle");
        assert_eq!(report.recomputes, 1);
        // The retry adopts the issue the first attempt filed.
        assert_eq!(world.forge.issue_count(), 1);
        assert_eq!(report.record.phase, ChapterPhase::IssueFiled);
    }

    #[test]
    fn recompute_budget_is_bounded() {
        let mut world = World::new();
        world.config.poll.max_recomputes = 0;
        world.store.interfere_next_save();
        let err = run_cycle(&world.ctx(), Intent::Reconcile, &Cancellation::new())
            .expect_err("stale");
        assert!(matches!(err, CycleError::StaleRevision { .. }));
    }

    #[test]
    fn fetch_failure_aborts_before_any_read() {
        let world = World::new();
        world.git.set_unavailable(true);
        let err = run_cycle(&world.ctx(), Intent::Reconcile, &Cancellation::new())
            .expect_err("fetch");
        assert!(matches!(err, CycleError::RemoteUnavailable(_)));
        assert_eq!(world.forge.issue_count(), 0);
    }

    #[test]
    fn out_of_range_record_is_fatal() {
        let world = World::new();
        world.store.seed("rq", ProgressRecord {
            chapter: 5,
            phase: ChapterPhase::InProgress,
            ..ProgressRecord::default()
        });
        let err = run_cycle(&world.ctx(), Intent::Reconcile, &Cancellation::new())
            .expect_err("fatal");
        assert!(matches!(err, CycleError::ActionFatal(_)));
    }

    #[test]
    fn cancelled_cycle_does_nothing() {
        let world = World::new();
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = run_cycle(&world.ctx(), Intent::Reconcile, &cancel).expect_err("cancelled");
        assert_eq!(err, CycleError::Cancelled);
        assert_eq!(world.git.fetch_count(), 0);
    }
}
