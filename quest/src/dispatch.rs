//! Action dispatcher: executes a decision and persists the resulting record.
//!
//! Every create is preceded by a search for the artifact's identity label, so
//! a retried dispatch adopts what an earlier, unpersisted attempt created.
//! Remote side effects count as done only once the record is saved.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::conflict::ConflictPolicy;
use crate::core::identity::{ArtifactKey, COMPLETED_LABEL};
use crate::core::types::{
    Action, ChapterPhase, Decision, IssueDraft, ProgressRecord, PullDraft, Sighting,
};
use crate::error::CycleError;
use crate::io::forge::{Forge, NewIssue, NewPull};
use crate::io::git::{LocalGit, PublishRequest};
use crate::io::progress_store::{ProgressStore, StoreError};
use crate::poll::Cancellation;

/// Side effect actually performed on the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Performed {
    Created { action: &'static str, number: u64 },
    /// An artifact with the same identity already existed and was reused.
    Adopted { action: &'static str, number: u64 },
    Labeled { issue: u64 },
    Closed { issue: u64 },
    Merged { pull: u64 },
    /// Protected paths rewritten in the learner's working copy.
    Restored { paths: Vec<String> },
}

/// Result of applying one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Record as persisted (or as loaded, when nothing changed).
    pub record: ProgressRecord,
    pub performed: Vec<Performed>,
    pub persisted: bool,
}

/// Applies decisions for one instance.
pub struct Dispatcher<'a, F: ?Sized, G: ?Sized, S: ?Sized> {
    pub forge: &'a F,
    pub git: &'a G,
    pub store: &'a S,
    pub instance_id: &'a str,
    pub chapter_count: usize,
    pub auto_merge_resets: bool,
    /// Game-area markers honored when writing protected files.
    pub policy: &'a ConflictPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullSlot {
    Starter,
    Reset,
}

impl<F, G, S> Dispatcher<'_, F, G, S>
where
    F: Forge + ?Sized,
    G: LocalGit + ?Sized,
    S: ProgressStore + ?Sized,
{
    /// Execute `decision` and persist its record with revision `based_on + 1`.
    #[instrument(skip_all, fields(instance = self.instance_id, based_on = decision.based_on))]
    pub fn apply(
        &self,
        decision: &Decision,
        cancel: &Cancellation,
    ) -> Result<DispatchOutcome, CycleError> {
        let current = self
            .store
            .load_progress(self.instance_id)
            .map_err(store_error)?
            .unwrap_or_default();
        if current.revision != decision.based_on {
            return Err(CycleError::StaleRevision {
                expected: decision.based_on,
                found: current.revision,
            });
        }
        self.check_transition(&current, &decision.next)?;

        if !decision.is_change(&current) {
            debug!("decision changes nothing");
            return Ok(DispatchOutcome {
                record: current,
                performed: Vec::new(),
                persisted: false,
            });
        }

        let mut next = decision.next.clone();
        let mut performed = Vec::new();
        for action in &decision.actions {
            cancel.check()?;
            self.perform(action, &mut next, &mut performed)?;
        }

        cancel.check()?;
        next.revision = decision.based_on + 1;
        self.store
            .save_progress(self.instance_id, &next, decision.based_on)
            .map_err(store_error)?;
        info!(
            chapter = next.chapter,
            phase = next.phase.as_str(),
            revision = next.revision,
            actions = decision.actions.len(),
            "progress advanced"
        );
        Ok(DispatchOutcome {
            record: next,
            performed,
            persisted: true,
        })
    }

    fn check_transition(
        &self,
        current: &ProgressRecord,
        next: &ProgressRecord,
    ) -> Result<(), CycleError> {
        if next.chapter >= self.chapter_count {
            return Err(CycleError::ActionFatal(format!(
                "chapter {} is past the last chapter ({} chapters)",
                next.chapter, self.chapter_count
            )));
        }
        if next.chapter < current.chapter {
            return Err(CycleError::ActionFatal(format!(
                "chapter would move backwards from {} to {}",
                current.chapter, next.chapter
            )));
        }
        if next.chapter > current.chapter + 1 {
            return Err(CycleError::ActionFatal(format!(
                "chapter would skip from {} to {}",
                current.chapter, next.chapter
            )));
        }
        if current.phase == ChapterPhase::Finished && !current.same_state(next) {
            return Err(CycleError::ActionFatal(
                "quest is finished; refusing to advance further".to_string(),
            ));
        }
        Ok(())
    }

    fn perform(
        &self,
        action: &Action,
        next: &mut ProgressRecord,
        performed: &mut Vec<Performed>,
    ) -> Result<(), CycleError> {
        match action {
            Action::FileIssue(draft) => {
                let number = self.ensure_issue(action.name(), draft, performed)?;
                next.pins.issue = Some(number);
            }
            Action::OpenStarterPr(draft) => {
                let number = self.ensure_pull(action.name(), draft, PullSlot::Starter, performed)?;
                next.pins.starter_pr = Some(number);
            }
            Action::FileResetPr(draft) => {
                let number = self.ensure_pull(action.name(), draft, PullSlot::Reset, performed)?;
                next.pins.reset_pr = Some(number);
            }
            Action::MarkCompleted { issue } => {
                let labels = self.forge.list_labels(*issue).map_err(|err| {
                    CycleError::from_write(&format!("list labels of #{issue}"), err)
                })?;
                if !labels.iter().any(|label| label == COMPLETED_LABEL) {
                    self.forge
                        .set_label(*issue, COMPLETED_LABEL)
                        .map_err(|err| CycleError::from_write(&format!("label #{issue}"), err))?;
                    performed.push(Performed::Labeled { issue: *issue });
                }
            }
            Action::CloseIssue { issue } => {
                let sighting = self
                    .forge
                    .get_issue(*issue)
                    .map_err(|err| CycleError::from_write(&format!("get #{issue}"), err))?;
                if sighting.is_open() {
                    self.forge
                        .close_issue(*issue)
                        .map_err(|err| CycleError::from_write(&format!("close #{issue}"), err))?;
                    performed.push(Performed::Closed { issue: *issue });
                }
            }
            Action::RestoreWorkingCopy { paths } => {
                let restored = self
                    .git
                    .restore_paths(paths, self.policy)
                    .map_err(|err| CycleError::local("restore working copy", err))?;
                if !restored.is_empty() {
                    info!(paths = ?restored, "protected paths restored in working copy");
                    performed.push(Performed::Restored { paths: restored });
                }
            }
        }
        Ok(())
    }

    fn ensure_issue(
        &self,
        action: &'static str,
        draft: &IssueDraft,
        performed: &mut Vec<Performed>,
    ) -> Result<u64, CycleError> {
        let existing = self
            .forge
            .find_issues(draft.key.label())
            .map_err(|err| CycleError::from_write(&format!("search {}", draft.key), err))?;
        if let Some(found) = first_writer(existing) {
            debug!(number = found.number, key = %draft.key, "adopting existing issue");
            performed.push(Performed::Adopted {
                action,
                number: found.number,
            });
            return Ok(found.number);
        }

        let number = self
            .forge
            .create_issue(&NewIssue {
                title: draft.title.clone(),
                body: draft.body.clone(),
                labels: draft.labels.clone(),
            })
            .map_err(|err| CycleError::from_write(&format!("create issue {}", draft.key), err))?;
        info!(number, key = %draft.key, "issue filed");
        performed.push(Performed::Created { action, number });
        Ok(number)
    }

    fn ensure_pull(
        &self,
        action: &'static str,
        draft: &PullDraft,
        slot: PullSlot,
        performed: &mut Vec<Performed>,
    ) -> Result<u64, CycleError> {
        let existing = self
            .forge
            .find_pulls(draft.key.label())
            .map_err(|err| CycleError::from_write(&format!("search {}", draft.key), err))?;
        let (number, open) = match first_writer(existing) {
            Some(found) => {
                debug!(number = found.number, key = %draft.key, "adopting existing pull request");
                performed.push(Performed::Adopted {
                    action,
                    number: found.number,
                });
                (found.number, found.is_open())
            }
            None => (self.create_pull(action, draft, performed)?, true),
        };

        if slot == PullSlot::Reset && self.auto_merge_resets && open {
            self.forge
                .merge_pull(number)
                .map_err(|err| CycleError::from_write(&format!("merge #{number}"), err))?;
            info!(number, "reset pull request merged");
            performed.push(Performed::Merged { pull: number });
        }
        Ok(number)
    }

    fn create_pull(
        &self,
        action: &'static str,
        draft: &PullDraft,
        performed: &mut Vec<Performed>,
    ) -> Result<u64, CycleError> {
        let sha = self
            .git
            .publish_branch(&PublishRequest {
                branch: draft.head.clone(),
                base: draft.base_commit.clone(),
                content: draft.content.clone(),
                message: commit_message(&draft.key, &draft.title),
                policy: self.policy.clone(),
            })
            .map_err(|err| {
                warn!(err = %format!("{err:#}"), branch = %draft.head, "branch publication failed");
                CycleError::RemoteUnavailable(format!("publish {}: {err:#}", draft.head))
            })?;
        debug!(%sha, branch = %draft.head, "head branch published");

        let number = self
            .forge
            .create_pull(&NewPull {
                head: draft.head.clone(),
                base: draft.base_branch.clone(),
                title: draft.title.clone(),
                body: draft.body.clone(),
                labels: draft.labels.clone(),
            })
            .map_err(|err| {
                CycleError::from_write(&format!("create pull request {}", draft.key), err)
            })?;
        info!(number, key = %draft.key, "pull request opened");
        performed.push(Performed::Created { action, number });
        Ok(number)
    }
}

fn first_writer(found: Vec<Sighting>) -> Option<Sighting> {
    found.into_iter().min_by_key(|sighting| sighting.number)
}

fn commit_message(key: &ArtifactKey, title: &str) -> String {
    format!("{title}\n\nQuest-Key: {}", key.label())
}

fn store_error(err: StoreError) -> CycleError {
    match err {
        StoreError::Conflict { expected, found } => CycleError::StaleRevision { expected, found },
        StoreError::Io(err) => CycleError::local("progress store", err),
    }
}
