//! Background poll triggers: a timer per instance and a working-copy watcher.

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use quest::session::{PollOutcome, PollTrigger, QuestSession};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Directories whose churn never affects the learner's code.
const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Start one timer-driven poll loop per instance.
pub fn start_timer_pollers(state: &AppState) {
    for session in state.orchestrator.sessions() {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(session.poll_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                poll(&session, PollTrigger::Timer).await;
            }
        });
    }
}

/// Start one file watcher per instance working copy.
pub fn start_file_watchers(state: &AppState) {
    for session in state.orchestrator.sessions() {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if let Err(e) = run_file_watcher(&session).await {
                warn!(instance = %session.id(), error = %e, "file watcher failed");
            }
        });
    }
}

async fn run_file_watcher(session: &Arc<QuestSession>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(500)),
    )?;

    let workdir = session.instance().workdir.clone();
    watcher.watch(&workdir, RecursiveMode::Recursive)?;
    info!(instance = %session.id(), path = %workdir.display(), "watching working copy");

    // Batch bursts of edits (an editor save, a checkout) into one trigger.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                let relevant = process_events(&workdir, &pending_events);
                pending_events.clear();
                if relevant {
                    poll(session, PollTrigger::FileChange).await;
                }
            }
        }
    }
}

/// Whether any event touches a file that can change the conflict verdict.
fn process_events(workdir: &Path, events: &[NotifyEvent]) -> bool {
    events
        .iter()
        .filter(|event| {
            matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            )
        })
        .flat_map(|event| &event.paths)
        .any(|path| is_relevant(workdir, path))
}

fn is_relevant(workdir: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(workdir) else {
        return false;
    };
    !rel.components().any(|component| {
        matches!(component, Component::Normal(name)
            if IGNORED_DIRS.iter().any(|dir| name == *dir))
    })
}

/// Cycles shell out and block; run them on the blocking pool.
async fn poll(session: &Arc<QuestSession>, trigger: PollTrigger) {
    let session = Arc::clone(session);
    let id = session.id().to_string();
    match tokio::task::spawn_blocking(move || session.trigger_poll(trigger)).await {
        Ok(PollOutcome::Completed(report)) => {
            debug!(instance = %id, ?trigger, phase = ?report.record.phase, "poll completed");
        }
        Ok(PollOutcome::Halted) => {
            debug!(instance = %id, ?trigger, "polling halted");
        }
        // The session already logged and published the failure.
        Ok(PollOutcome::Failed(_)) => {}
        Err(e) => warn!(instance = %id, error = %e, "poll task panicked"),
    }
}
