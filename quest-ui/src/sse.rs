//! Server-Sent Events stream of instance views.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use quest::session::InstanceView;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    id: &'a str,
    view: &'a InstanceView,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        match event {
            ChangeEvent::InstanceChanged { view } => SsePayload {
                event_type: "instance_changed",
                id: &view.id,
                view,
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    // Late subscribers start from the current views.
    let initial: Vec<InstanceView> = state
        .orchestrator
        .sessions()
        .map(|session| session.current_state())
        .collect();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        for view in initial {
            let event = ChangeEvent::InstanceChanged { view: Box::new(view) };
            if let Ok(json) = serde_json::to_string(&SsePayload::from(&event)) {
                yield Ok(Event::default().event("change").data(json));
            }
        }

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Forward every session's published views onto the broadcast channel.
pub fn start_view_forwarders(state: &AppState) {
    for session in state.orchestrator.sessions() {
        let mut rx = session.subscribe();
        let tx = state.event_tx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let view = rx.borrow_and_update().clone();
                debug!(instance = %view.id, phase = ?view.phase, "broadcasting instance change");
                // No receivers just means no browser is connected.
                let _ = tx.send(ChangeEvent::InstanceChanged {
                    view: Box::new(view),
                });
            }
        });
    }
}
