//! Remote state reader: the current chapter's artifacts as seen on the forge.

use tracing::{debug, instrument, warn};

use crate::core::identity::{ArtifactKey, ArtifactKind};
use crate::core::types::{ProgressRecord, RemoteObservation, Sighting};
use crate::error::CycleError;
use crate::io::forge::{Forge, ForgeError};
use crate::quest::Quest;

/// What to observe.
#[derive(Debug, Clone, Copy)]
pub struct RemoteQuery<'a> {
    pub instance_id: &'a str,
    pub quest: &'a Quest,
    pub record: &'a ProgressRecord,
    pub default_branch: &'a str,
    pub learner_branch: &'a str,
    /// Report pinned artifacts that vanished or lost their identity as
    /// `RemoteInconsistent`. When false they are logged and searched for again.
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Issue,
    Pull,
}

/// Observe the forge for the record's current chapter. Pure read.
#[instrument(skip_all, fields(instance = query.instance_id, chapter = query.record.chapter))]
pub fn observe<F: Forge + ?Sized>(
    forge: &F,
    query: &RemoteQuery<'_>,
) -> Result<RemoteObservation, CycleError> {
    let record = query.record;
    let chapter = record.chapter;
    let key = |kind| ArtifactKey::new(query.instance_id, chapter, kind);

    let issue = locate(
        forge,
        Kind::Issue,
        &key(ArtifactKind::ChapterIssue),
        record.pins.issue,
        query.strict,
    )?;

    let has_starter = query
        .quest
        .chapter(chapter)
        .is_some_and(|ch| ch.starter.is_some());
    let starter_pr = if has_starter {
        locate(
            forge,
            Kind::Pull,
            &key(ArtifactKind::StarterPr),
            record.pins.starter_pr,
            query.strict,
        )?
    } else {
        None
    };

    let reset_pr = match record.reset {
        Some(reset) => locate(
            forge,
            Kind::Pull,
            &key(ArtifactKind::ResetPr {
                attempt: reset.attempt,
            }),
            record.pins.reset_pr,
            query.strict,
        )?,
        None => None,
    };

    let default_head = branch_head(forge, query.default_branch)?;
    let learner_head = if query.learner_branch == query.default_branch {
        default_head.clone()
    } else {
        branch_head(forge, query.learner_branch)?
    };

    debug!(
        issue = ?issue.as_ref().map(|s| (s.number, s.state)),
        starter_pr = ?starter_pr.as_ref().map(|s| (s.number, s.state)),
        reset_pr = ?reset_pr.as_ref().map(|s| (s.number, s.state)),
        "remote observed"
    );
    Ok(RemoteObservation {
        issue,
        starter_pr,
        reset_pr,
        default_head,
        learner_head,
    })
}

fn branch_head<F: Forge + ?Sized>(forge: &F, branch: &str) -> Result<String, CycleError> {
    forge
        .branch_head(branch)
        .map_err(|err| CycleError::from_read(&format!("head of {branch}"), err))
}

/// Find the artifact for `key`: by pin when recorded, else by identity label.
fn locate<F: Forge + ?Sized>(
    forge: &F,
    kind: Kind,
    key: &ArtifactKey,
    pinned: Option<u64>,
    strict: bool,
) -> Result<Option<Sighting>, CycleError> {
    if let Some(number) = pinned {
        let fetched = match kind {
            Kind::Issue => forge.get_issue(number),
            Kind::Pull => forge.get_pull(number),
        };
        let problem = match fetched {
            Ok(sighting) if sighting.has_label(key.label()) => return Ok(Some(sighting)),
            Ok(_) => format!("#{number} ({key}) no longer carries its identity label"),
            Err(ForgeError::NotFound(_)) => format!("#{number} ({key}) was deleted"),
            Err(err) => return Err(CycleError::from_read(&format!("get #{number}"), err)),
        };
        if strict {
            return Err(CycleError::RemoteInconsistent(problem));
        }
        warn!(%problem, "ignoring inconsistent pinned artifact");
    }

    let found = match kind {
        Kind::Issue => forge.find_issues(key.label()),
        Kind::Pull => forge.find_pulls(key.label()),
    }
    .map_err(|err| CycleError::from_read(&format!("search {}", key.label()), err))?;
    // First writer wins.
    Ok(found.into_iter().min_by_key(|sighting| sighting.number))
}
