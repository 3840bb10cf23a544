//! Long-lived per-instance sessions and the orchestrator registry.
//!
//! A [`QuestSession`] owns the capabilities for one quest instance and runs at
//! most one poll cycle at a time. Triggers arriving while a cycle is in
//! flight wait for it and share its outcome. Sessions publish an
//! [`InstanceView`] on a `watch` channel after every cycle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::conflict::ConflictReport;
use crate::core::types::{ChapterPhase, ConflictVerdict, ProgressRecord, Wait};
use crate::detect;
use crate::error::{CycleError, Severity};
use crate::io::config::{QuestConfig, quest_dir};
use crate::io::forge::{Forge, GhForge};
use crate::io::git::{Git, LocalGit};
use crate::io::local;
use crate::io::progress_store::{FileProgressStore, ProgressStore};
use crate::io::quest_store::load_quest;
use crate::poll::{Cancellation, CycleContext, CycleReport, Intent, UPSTREAM_REMOTE, run_cycle};
use crate::quest::QuestInstance;

/// What caused a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTrigger {
    Timer,
    /// Working-copy file change.
    FileChange,
    /// Explicit refresh by the learner. Clears a halt.
    Manual,
}

impl PollTrigger {
    fn respects_halt(self) -> bool {
        !matches!(self, PollTrigger::Manual)
    }
}

/// Result of a poll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(Box<CycleReport>),
    Failed(CycleError),
    /// Polling is halted; only a manual refresh runs a cycle.
    Halted,
}

impl PollOutcome {
    pub fn error(&self) -> Option<&CycleError> {
        match self {
            PollOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Last error as shown to the learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorView {
    pub kind: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl From<&CycleError> for ErrorView {
    fn from(err: &CycleError) -> Self {
        Self {
            kind: err.kind(),
            severity: err.severity(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of an instance for front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub quest_id: String,
    pub repository: String,
    pub chapter: usize,
    pub chapter_count: usize,
    pub chapter_title: Option<String>,
    pub phase: ChapterPhase,
    pub revision: u64,
    pub last_verdict: Option<ConflictVerdict>,
    pub drifted_paths: Vec<String>,
    pub waiting_for: Option<Wait>,
    pub last_error: Option<ErrorView>,
    pub halted: bool,
    pub finished: bool,
    pub polling: bool,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl InstanceView {
    fn initial(instance: &QuestInstance, record: &ProgressRecord) -> Self {
        let mut view = Self {
            id: instance.id.clone(),
            quest_id: instance.quest.id.clone(),
            repository: instance.repository.clone(),
            chapter: 0,
            chapter_count: instance.quest.chapters.len(),
            chapter_title: None,
            phase: ChapterPhase::NotStarted,
            revision: 0,
            last_verdict: None,
            drifted_paths: Vec::new(),
            waiting_for: None,
            last_error: None,
            halted: false,
            finished: false,
            polling: false,
            last_polled_at: None,
        };
        view.apply_record(instance, record);
        view
    }

    fn apply_record(&mut self, instance: &QuestInstance, record: &ProgressRecord) {
        self.chapter = record.chapter;
        self.chapter_title = instance.quest.chapter(record.chapter).map(|ch| ch.title.clone());
        self.phase = record.phase;
        self.revision = record.revision;
        self.finished = record.phase == ChapterPhase::Finished;
    }
}

#[derive(Default)]
struct Gate {
    running: bool,
    /// Completed cycles; lets waiters tell their cycle from a later one.
    generation: u64,
    last: Option<PollOutcome>,
    halted: bool,
    cancel: Option<Cancellation>,
}

/// One quest instance and its capabilities.
pub struct QuestSession {
    instance: QuestInstance,
    config: QuestConfig,
    forge: Arc<dyn Forge>,
    git: Arc<dyn LocalGit>,
    store: Arc<dyn ProgressStore>,
    gate: Mutex<Gate>,
    settled: Condvar,
    view: watch::Sender<InstanceView>,
}

impl QuestSession {
    pub fn new(
        instance: QuestInstance,
        config: QuestConfig,
        forge: Arc<dyn Forge>,
        git: Arc<dyn LocalGit>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        let record = match store.load_progress(&instance.id) {
            Ok(record) => record.unwrap_or_default(),
            Err(err) => {
                warn!(instance = %instance.id, %err, "could not load progress; showing defaults");
                ProgressRecord::default()
            }
        };
        let (view, _) = watch::channel(InstanceView::initial(&instance, &record));
        Self {
            instance,
            config,
            forge,
            git,
            store,
            gate: Mutex::new(Gate::default()),
            settled: Condvar::new(),
            view,
        }
    }

    /// Wire a session for a working copy with the `gh` and `git` adapters.
    pub fn open(workdir: &Path, config: QuestConfig) -> Result<Self> {
        config.validate().context("validate config")?;
        let git = Git::new(workdir).with_network_timeout(config.forge.timeout() * 6);
        let repository = match &config.forge.repository {
            Some(repository) => repository.clone(),
            None => git.origin_repository().context("derive forge repository")?,
        };
        let quest = load_quest(&git, workdir, &config.quest).context("load quest definition")?;
        let id = config.instance_id_for(workdir);
        let forge = GhForge::new(repository.clone(), &config.forge);
        let store = FileProgressStore::new(quest_dir(workdir));
        let instance = QuestInstance::new(id, repository, workdir, Arc::new(quest));
        info!(instance = %instance.id, quest = %instance.quest.id, "session opened");
        Ok(Self::new(
            instance,
            config,
            Arc::new(forge),
            Arc::new(git),
            Arc::new(store),
        ))
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }

    pub fn instance(&self) -> &QuestInstance {
        &self.instance
    }

    pub fn config(&self) -> &QuestConfig {
        &self.config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll.interval_secs)
    }

    pub fn current_state(&self) -> InstanceView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceView> {
        self.view.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.lock_gate().halted
    }

    /// Run a reconcile cycle, or join the one in flight.
    pub fn trigger_poll(&self, trigger: PollTrigger) -> PollOutcome {
        self.run(Intent::Reconcile, trigger)
    }

    /// Run a reference-solution cycle after any in-flight cycle settles.
    ///
    /// Counts as a learner action, so it clears a halt.
    pub fn request_reference_solution(&self) -> PollOutcome {
        self.run(Intent::ReferenceSolution, PollTrigger::Manual)
    }

    /// Cancel the cycle in flight, if any.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.lock_gate().cancel {
            cancel.cancel();
        }
    }

    /// Classify local edits for the current chapter without touching the forge.
    pub fn check(&self) -> Result<ConflictReport, CycleError> {
        let record = self
            .store
            .load_progress(&self.instance.id)
            .map_err(|err| CycleError::LocalUnavailable(format!("load progress: {err}")))?
            .unwrap_or_default();
        let upstream = format!("{UPSTREAM_REMOTE}/{}", self.config.forge.learner_branch);
        let observed = local::observe(self.git.as_ref(), &upstream)?;
        detect::evaluate(
            self.git.as_ref(),
            &self.instance.quest,
            &record,
            &observed,
            &self.config.conflict.policy(),
        )
    }

    fn run(&self, intent: Intent, trigger: PollTrigger) -> PollOutcome {
        let mut gate = self.lock_gate();
        if gate.running {
            let generation = gate.generation;
            gate = self
                .settled
                .wait_while(gate, |g| g.running && g.generation == generation)
                .unwrap_or_else(PoisonError::into_inner);
            if intent == Intent::Reconcile
                && let Some(outcome) = &gate.last
            {
                debug!(instance = %self.instance.id, "joined in-flight poll");
                return outcome.clone();
            }
            // A reference-solution request needs its own cycle.
            gate = self
                .settled
                .wait_while(gate, |g| g.running)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if trigger.respects_halt() && gate.halted {
            debug!(instance = %self.instance.id, ?trigger, "polling halted; skipping");
            return PollOutcome::Halted;
        }
        if !trigger.respects_halt() && gate.halted {
            info!(instance = %self.instance.id, "halt cleared by learner");
            gate.halted = false;
        }
        let cancel = Cancellation::new();
        gate.running = true;
        gate.cancel = Some(cancel.clone());
        drop(gate);
        self.view.send_modify(|view| {
            view.polling = true;
            view.halted = false;
        });

        let ctx = CycleContext {
            instance_id: &self.instance.id,
            quest: &self.instance.quest,
            config: &self.config,
            forge: self.forge.as_ref(),
            git: self.git.as_ref(),
            store: self.store.as_ref(),
        };
        let outcome = match run_cycle(&ctx, intent, &cancel) {
            Ok(report) => PollOutcome::Completed(Box::new(report)),
            Err(err) => PollOutcome::Failed(err),
        };
        let halted = outcome.error().is_some_and(CycleError::halts_polling);
        self.log_outcome(&outcome);
        self.publish(&outcome, halted);

        let mut gate = self.lock_gate();
        gate.running = false;
        gate.generation += 1;
        gate.halted = halted;
        gate.cancel = None;
        gate.last = Some(outcome.clone());
        drop(gate);
        self.settled.notify_all();
        outcome
    }

    fn log_outcome(&self, outcome: &PollOutcome) {
        let id = &self.instance.id;
        match outcome {
            PollOutcome::Completed(report) if report.persisted => info!(
                instance = %id,
                chapter = report.record.chapter,
                phase = report.record.phase.as_str(),
                "poll applied changes"
            ),
            PollOutcome::Completed(_) | PollOutcome::Halted => debug!(instance = %id, "poll quiet"),
            PollOutcome::Failed(err) => match err.severity() {
                Severity::Internal => error!(instance = %id, %err, "poll failed"),
                Severity::NeedsAttention => warn!(instance = %id, %err, "poll needs attention"),
                Severity::Transient => info!(instance = %id, %err, "poll failed; will retry"),
            },
        }
    }

    fn publish(&self, outcome: &PollOutcome, halted: bool) {
        let now = Utc::now();
        self.view.send_modify(|view| {
            view.polling = false;
            view.halted = halted;
            view.last_polled_at = Some(now);
            match outcome {
                PollOutcome::Completed(report) => {
                    view.apply_record(&self.instance, &report.record);
                    view.last_verdict = Some(report.conflict.verdict);
                    view.drifted_paths = report.conflict.drifted_paths.clone();
                    view.waiting_for = report.decision.wait;
                    view.last_error = None;
                }
                PollOutcome::Failed(err) => {
                    view.last_error = Some(ErrorView::from(err));
                }
                PollOutcome::Halted => {}
            }
        });
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unknown instance id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown quest instance '{0}'")]
pub struct UnknownInstance(pub String);

/// Registry of sessions, keyed by instance id. Instances share no state.
#[derive(Default)]
pub struct Orchestrator {
    sessions: BTreeMap<String, Arc<QuestSession>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing one with the same id.
    pub fn insert(&mut self, session: QuestSession) -> Arc<QuestSession> {
        let session = Arc::new(session);
        self.sessions.insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<QuestSession>> {
        self.sessions.values()
    }

    pub fn session(&self, id: &str) -> Result<&Arc<QuestSession>, UnknownInstance> {
        self.sessions
            .get(id)
            .ok_or_else(|| UnknownInstance(id.to_string()))
    }

    pub fn current_state(&self, id: &str) -> Result<InstanceView, UnknownInstance> {
        Ok(self.session(id)?.current_state())
    }

    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<InstanceView>, UnknownInstance> {
        Ok(self.session(id)?.subscribe())
    }

    pub fn trigger_poll(
        &self,
        id: &str,
        trigger: PollTrigger,
    ) -> Result<PollOutcome, UnknownInstance> {
        Ok(self.session(id)?.trigger_poll(trigger))
    }

    pub fn request_reference_solution(&self, id: &str) -> Result<PollOutcome, UnknownInstance> {
        Ok(self.session(id)?.request_reference_solution())
    }
}
