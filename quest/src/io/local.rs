//! Local state reader: the working copy relative to the learner's upstream.

use tracing::{debug, instrument};

use crate::core::types::LocalObservation;
use crate::error::CycleError;
use crate::io::git::LocalGit;

/// Observe the working copy. `upstream` is the remote-tracking ref of the
/// learner branch (e.g. `origin/main`).
#[instrument(skip_all, fields(upstream = %upstream))]
pub fn observe<G: LocalGit + ?Sized>(
    git: &G,
    upstream: &str,
) -> Result<LocalObservation, CycleError> {
    let head = git
        .head_commit()
        .map_err(|err| CycleError::local("read HEAD", err))?;
    let dirty = git
        .is_dirty()
        .map_err(|err| CycleError::local("read worktree status", err))?;
    let (ahead, behind) = git
        .ahead_behind(upstream)
        .map_err(|err| CycleError::local(&format!("compare HEAD with {upstream}"), err))?;
    debug!(%head, dirty, ahead, behind, "local observed");
    Ok(LocalObservation {
        head,
        dirty,
        ahead,
        behind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGit;

    #[test]
    fn reports_head_dirty_and_divergence() {
        let git = FakeGit::new();
        git.set_head("abc123");
        git.set_dirty(true);
        git.set_ahead_behind(1, 2);
        let observed = observe(&git, "origin/main").expect("observe");
        assert_eq!(
            observed,
            LocalObservation {
                head: "abc123".to_string(),
                dirty: true,
                ahead: 1,
                behind: 2,
            }
        );
    }

    #[test]
    fn git_failure_is_local_unavailable() {
        let git = FakeGit::new();
        git.set_unavailable(true);
        let err = observe(&git, "origin/main").expect_err("unavailable");
        assert!(matches!(err, CycleError::LocalUnavailable(_)));
    }
}
