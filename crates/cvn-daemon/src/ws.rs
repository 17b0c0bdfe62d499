// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket fan-out endpoints.
//!
//! `/api/modder/hooks/ws` streams hook envelopes through a bounded
//! per-subscriber queue; overflow shows up as a synthetic `__dropped`
//! envelope ahead of the next real event. `/api/schedule/ws` streams full
//! job records on every state change.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use cvn_core::JobId;
use cvn_events::TopicFilter;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub(crate) struct TopicsQuery {
    topics: Option<String>,
}

/// `GET /api/modder/hooks/ws?topics=a,b`
pub(crate) async fn hooks_ws(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TopicsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let filter = q
        .topics
        .as_deref()
        .map(TopicFilter::parse)
        .unwrap_or_default();
    let capacity = state.config.hooks.ws_queue_capacity;
    upgrade.on_upgrade(move |socket| run_hooks_ws(state, socket, filter, capacity))
}

async fn run_hooks_ws(
    state: Arc<AppState>,
    mut socket: WebSocket,
    filter: TopicFilter,
    capacity: usize,
) {
    let rx = state.bus.subscribe(filter, capacity);
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let text = match serde_json::to_string(&envelope) {
                    Ok(t) => t,
                    Err(e) => {
                        let err = json!({
                            "event": "__error",
                            "kind": "internal_error",
                            "message": e.to_string(),
                        });
                        let _ = socket.send(Message::Text(err.to_string().into())).await;
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients only ever close or ping; both are handled by
                    // axum, anything else is ignored.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "hooks ws receive error");
                        break;
                    }
                }
            }
        }
    }
    debug!(dropped = rx.dropped(), "hooks ws closed");
}

/// `GET /api/schedule/ws` — job state delta stream; each message is the full
/// record after the transition.
pub(crate) async fn schedule_ws(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let capacity = state.config.hooks.ws_queue_capacity;
    upgrade.on_upgrade(move |socket| run_schedule_ws(state, socket, capacity))
}

async fn run_schedule_ws(state: Arc<AppState>, mut socket: WebSocket, capacity: usize) {
    let rx = state
        .bus
        .subscribe(TopicFilter::new(["on_job_state_changed"]), capacity);
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                if envelope.event == "__dropped" {
                    let text = serde_json::to_string(&envelope).unwrap_or_default();
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    continue;
                }
                let Some(id) = envelope
                    .payload
                    .get("id")
                    .and_then(|v| v.as_str())
                    .and_then(JobId::parse)
                else {
                    continue;
                };
                let message = match state.scheduler.state(&id).await {
                    Ok(record) => serde_json::to_string(&record).unwrap_or_default(),
                    Err(e) => json!({
                        "event": "__error",
                        "kind": e.kind,
                        "message": e.message,
                    })
                    .to_string(),
                };
                if socket.send(Message::Text(message.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
