//! Quest orchestrator: reconciles a learner's quest repository with its chapters.
//!
//! Progress lives on a forge as issues, pull requests and labels. Each poll
//! reads the forge and the local working copy, classifies the learner's
//! edits, decides the next step and applies it idempotently.
//!
//! - **[`core`]**: Pure, deterministic logic (identities, conflict
//!   classification, the progression state machine). No I/O.
//! - **[`io`]**: Side-effecting capabilities (forge via `gh`, git, progress
//!   store, config) behind traits so tests can swap in fakes.
//!
//! [`poll`] runs one observe/decide/dispatch cycle; [`session`] serializes
//! cycles per instance and publishes their results to front ends.

pub mod core;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod poll;
pub mod quest;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
