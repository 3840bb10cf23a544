//! HTTP route handlers for the orchestrator API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use quest::session::{ErrorView, InstanceView, PollOutcome};
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/instances", get(list_instances))
        .route("/instances/{id}/state", get(get_state))
        .route("/instances/{id}/poll", post(trigger_poll))
        .route(
            "/instances/{id}/reference-solution",
            post(request_reference_solution),
        )
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/instances - current view of every instance.
async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(
        state
            .orchestrator
            .sessions()
            .map(|session| session.current_state())
            .collect(),
    )
}

/// GET /api/instances/:id/state
async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, StatusCode> {
    state
        .orchestrator
        .current_state(&id)
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct PollResponse {
    /// `completed`, `failed` or `halted`.
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorView>,
    view: InstanceView,
}

/// POST /api/instances/:id/poll - manual refresh; clears a halt.
async fn trigger_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>, StatusCode> {
    run_blocking(state, id, Request::Poll).await
}

/// POST /api/instances/:id/reference-solution
async fn request_reference_solution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>, StatusCode> {
    run_blocking(state, id, Request::ReferenceSolution).await
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Poll,
    ReferenceSolution,
}

/// Cycles block on `gh` and `git`; keep them off the async workers.
async fn run_blocking(
    state: AppState,
    id: String,
    request: Request,
) -> Result<Json<PollResponse>, StatusCode> {
    let session = state
        .orchestrator
        .session(&id)
        .map_err(|_| StatusCode::NOT_FOUND)?
        .clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = match request {
            Request::Poll => session.trigger_poll(quest::session::PollTrigger::Manual),
            Request::ReferenceSolution => session.request_reference_solution(),
        };
        (outcome, session.current_state())
    })
    .await;
    let (outcome, view) = outcome.map_err(|err| {
        warn!(error = %err, "poll task failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(PollResponse {
        outcome: match &outcome {
            PollOutcome::Completed(_) => "completed",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Halted => "halted",
        },
        error: outcome.error().map(ErrorView::from),
        view,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quest::core::types::ChapterPhase;
    use quest::io::config::QuestConfig;
    use quest::quest::QuestInstance;
    use quest::session::{Orchestrator, QuestSession};
    use quest::test_support::{FakeForge, FakeGit, MemoryProgressStore, chapter, quest_with};

    use super::*;

    fn app_state(forge: Arc<FakeForge>) -> AppState {
        let quest = quest_with(vec![chapter("one")]);
        let instance = QuestInstance::new("rq", "learner/quest", "/tmp/rq", Arc::new(quest));
        let session = QuestSession::new(
            instance,
            QuestConfig::default(),
            forge,
            Arc::new(FakeGit::new()),
            Arc::new(MemoryProgressStore::new()),
        );
        let mut orchestrator = Orchestrator::new();
        orchestrator.insert(session);
        AppState::new(orchestrator)
    }

    #[tokio::test]
    async fn manual_poll_returns_fresh_view() {
        let state = app_state(Arc::new(FakeForge::new()));
        let Json(response) = trigger_poll(State(state.clone()), Path("rq".to_string()))
            .await
            .expect("poll");
        assert_eq!(response.outcome, "completed");
        assert_eq!(response.view.phase, ChapterPhase::IssueFiled);

        let Json(view) = get_state(State(state), Path("rq".to_string()))
            .await
            .expect("state");
        assert_eq!(view.revision, 1);
    }

    #[tokio::test]
    async fn failed_poll_reports_error_kind() {
        let forge = Arc::new(FakeForge::new());
        forge.fail_next(quest::test_support::ForgeFailure::Unavailable);
        let state = app_state(forge);
        let Json(response) = trigger_poll(State(state), Path("rq".to_string()))
            .await
            .expect("poll");
        assert_eq!(response.outcome, "failed");
        assert_eq!(response.error.map(|e| e.kind), Some("remote_unavailable"));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let state = app_state(Arc::new(FakeForge::new()));
        let err = get_state(State(state.clone()), Path("nope".to_string()))
            .await
            .expect_err("missing");
        assert_eq!(err, StatusCode::NOT_FOUND);
        let err = request_reference_solution(State(state), Path("nope".to_string()))
            .await
            .expect_err("missing");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_all_instances() {
        let state = app_state(Arc::new(FakeForge::new()));
        let Json(views) = list_instances(State(state)).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "rq");
    }
}
