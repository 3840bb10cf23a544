//! Error taxonomy of one poll cycle.

use serde::Serialize;

use crate::io::forge::ForgeError;

/// Why a poll cycle ended without applying its decision.
///
/// Messages are flattened to strings so the last error can be cloned into
/// the instance view and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    /// Forge unreachable or timed out. Retried on the next poll.
    #[error("forge unavailable: {0}")]
    RemoteUnavailable(String),
    /// Forge state contradicts the progress record. Needs the learner.
    #[error("remote state is inconsistent: {0}")]
    RemoteInconsistent(String),
    /// Another writer created an artifact first. Recomputed.
    #[error("concurrent write to the same artifact: {0}")]
    ActionConflict(String),
    /// Invariant violation. Polling halts until a manual refresh.
    #[error("internal invariant violated: {0}")]
    ActionFatal(String),
    /// Local git, filesystem or progress store failed.
    #[error("local repository unavailable: {0}")]
    LocalUnavailable(String),
    /// The record changed between read and apply.
    #[error("stale decision: computed at revision {expected}, record is at {found}")]
    StaleRevision { expected: u64, found: u64 },
    #[error("poll cycle cancelled")]
    Cancelled,
    /// A reference-solution request was refused.
    #[error("request refused: {0}")]
    Refused(String),
}

/// How a failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stale state shown; retried automatically.
    Transient,
    /// Polling paused until the learner acts.
    NeedsAttention,
    Internal,
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::RemoteUnavailable(_) => "remote_unavailable",
            CycleError::RemoteInconsistent(_) => "remote_inconsistent",
            CycleError::ActionConflict(_) => "action_conflict",
            CycleError::ActionFatal(_) => "action_fatal",
            CycleError::LocalUnavailable(_) => "local_unavailable",
            CycleError::StaleRevision { .. } => "stale_revision",
            CycleError::Cancelled => "cancelled",
            CycleError::Refused(_) => "refused",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CycleError::RemoteUnavailable(_)
            | CycleError::ActionConflict(_)
            | CycleError::StaleRevision { .. }
            | CycleError::LocalUnavailable(_)
            | CycleError::Cancelled => Severity::Transient,
            CycleError::RemoteInconsistent(_) | CycleError::Refused(_) => {
                Severity::NeedsAttention
            }
            CycleError::ActionFatal(_) => Severity::Internal,
        }
    }

    /// Whether timer-driven polling stops until a manual refresh.
    pub fn halts_polling(&self) -> bool {
        matches!(
            self,
            CycleError::RemoteInconsistent(_) | CycleError::ActionFatal(_)
        )
    }

    /// Whether the cycle should recompute from fresh reads.
    pub fn is_recomputable(&self) -> bool {
        matches!(
            self,
            CycleError::ActionConflict(_) | CycleError::StaleRevision { .. }
        )
    }

    /// Translate a forge failure met while reading.
    pub fn from_read(context: &str, err: ForgeError) -> Self {
        match err {
            ForgeError::Unavailable(err) => {
                CycleError::RemoteUnavailable(format!("{context}: {err:#}"))
            }
            ForgeError::NotFound(msg) | ForgeError::AlreadyExists(msg) => {
                CycleError::RemoteInconsistent(format!("{context}: {msg}"))
            }
        }
    }

    /// Translate a forge failure met while writing.
    pub fn from_write(context: &str, err: ForgeError) -> Self {
        match err {
            ForgeError::Unavailable(err) => {
                CycleError::RemoteUnavailable(format!("{context}: {err:#}"))
            }
            ForgeError::AlreadyExists(msg) => {
                CycleError::ActionConflict(format!("{context}: {msg}"))
            }
            ForgeError::NotFound(msg) => {
                CycleError::RemoteInconsistent(format!("{context}: {msg}"))
            }
        }
    }

    pub fn local(context: &str, err: anyhow::Error) -> Self {
        CycleError::LocalUnavailable(format!("{context}: {err:#}"))
    }
}
