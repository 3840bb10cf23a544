//! Session-level polling: coalescing, halting and change notification.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quest::core::types::ChapterPhase;
use quest::error::CycleError;
use quest::io::config::QuestConfig;
use quest::quest::QuestInstance;
use quest::session::{Orchestrator, PollOutcome, PollTrigger, QuestSession};
use quest::test_support::{FakeForge, FakeGit, MemoryProgressStore, chapter, quest_with};

struct Parts {
    forge: Arc<FakeForge>,
    git: Arc<FakeGit>,
}

fn session(id: &str) -> (QuestSession, Parts) {
    let forge = Arc::new(FakeForge::new());
    let git = Arc::new(FakeGit::new());
    let quest = quest_with(vec![chapter("one"), chapter("two")]);
    let instance = QuestInstance::new(id, "learner/quest", format!("/tmp/{id}"), Arc::new(quest));
    let session = QuestSession::new(
        instance,
        QuestConfig::default(),
        Arc::clone(&forge) as _,
        Arc::clone(&git) as _,
        Arc::new(MemoryProgressStore::new()),
    );
    (session, Parts { forge, git })
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached");
}

#[test]
fn concurrent_triggers_share_one_cycle() {
    let (session, parts) = session("rq");
    let session = Arc::new(session);
    let release = parts.git.pause_next_fetch();

    let first = thread::spawn({
        let session = Arc::clone(&session);
        move || session.trigger_poll(PollTrigger::Timer)
    });
    wait_until(|| parts.git.fetch_count() == 1);
    assert!(session.current_state().polling);

    let second = thread::spawn({
        let session = Arc::clone(&session);
        move || session.trigger_poll(PollTrigger::Manual)
    });
    // Let the second trigger reach the gate before the first cycle finishes.
    thread::sleep(Duration::from_millis(100));
    release.send(()).expect("release fetch");

    let first = first.join().expect("first poll");
    let second = second.join().expect("second poll");
    assert!(matches!(first, PollOutcome::Completed(_)));
    assert_eq!(first, second);
    assert_eq!(parts.git.fetch_count(), 1);
    assert_eq!(parts.forge.issue_count(), 1);
}

#[test]
fn subscribers_see_each_cycle() {
    let (session, parts) = session("rq");
    let mut rx = session.subscribe();
    assert_eq!(rx.borrow_and_update().phase, ChapterPhase::NotStarted);

    session.trigger_poll(PollTrigger::FileChange);
    assert!(rx.has_changed().expect("sender alive"));
    assert_eq!(rx.borrow_and_update().phase, ChapterPhase::IssueFiled);

    parts.git.set_unavailable(true);
    session.trigger_poll(PollTrigger::Timer);
    let view = rx.borrow_and_update().clone();
    assert_eq!(view.phase, ChapterPhase::IssueFiled, "failed cycles keep the last good state");
    let error = view.last_error.expect("error shown");
    assert_eq!(error.kind, "remote_unavailable");
    assert!(!view.halted);
}

#[test]
fn reference_solution_request_clears_halt() {
    let (session, parts) = session("rq");
    session.trigger_poll(PollTrigger::Timer);
    parts.forge.delete(1);
    assert!(matches!(
        session.trigger_poll(PollTrigger::Timer),
        PollOutcome::Failed(CycleError::RemoteInconsistent(_))
    ));
    assert_eq!(session.trigger_poll(PollTrigger::Timer), PollOutcome::Halted);

    // Lenient reads let the request proceed past the vanished issue.
    let outcome = session.request_reference_solution();
    assert!(matches!(outcome, PollOutcome::Completed(_)), "{outcome:?}");
    assert!(!session.is_halted());
    assert_eq!(session.current_state().phase, ChapterPhase::Resetting);
}

#[test]
fn instances_poll_independently() {
    let mut orchestrator = Orchestrator::new();
    let (a, a_parts) = session("alpha");
    let (b, b_parts) = session("beta");
    orchestrator.insert(a);
    orchestrator.insert(b);

    b_parts.forge.fail_next(quest::test_support::ForgeFailure::Unavailable);
    let alpha = orchestrator.trigger_poll("alpha", PollTrigger::Timer).expect("alpha");
    let beta = orchestrator.trigger_poll("beta", PollTrigger::Timer).expect("beta");

    assert!(matches!(alpha, PollOutcome::Completed(_)));
    assert!(matches!(beta, PollOutcome::Failed(CycleError::RemoteUnavailable(_))));
    assert_eq!(a_parts.forge.issue_count(), 1);
    assert_eq!(b_parts.forge.issue_count(), 0);
    assert_eq!(
        orchestrator.current_state("alpha").expect("alpha").phase,
        ChapterPhase::IssueFiled
    );
    assert_eq!(
        orchestrator.ids().collect::<Vec<_>>(),
        vec!["alpha", "beta"]
    );
}
