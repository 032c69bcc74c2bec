//! The signaling relay itself
//!
//! A deliberately tiny rendezvous service: one pending message slot per
//! channel id. `POST /push/{id}` stores a message, overwriting any
//! unconsumed one (last write wins, never blocks the pusher).
//! `GET /pull/{id}` takes the pending message, blocking up to
//! [`PULL_WINDOW`] for one to appear, and answers 408 otherwise — pullers
//! treat that as "retry immediately".
//!
//! Lives in the library so the `meshwork-signal-server` binary and the
//! client tests serve the exact same router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::message::SignalMessage;

/// How long a pull blocks waiting for a push.
pub const PULL_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Slot {
    pending: Mutex<Option<SignalMessage>>,
    notify: Notify,
}

/// Shared relay state: one slot per channel id.
#[derive(Clone, Default)]
pub struct RelayState {
    channels: Arc<Mutex<HashMap<String, Arc<Slot>>>>,
}

impl RelayState {
    async fn slot(&self, id: &str) -> Arc<Slot> {
        let mut channels = self.channels.lock().await;
        channels.entry(id.to_string()).or_default().clone()
    }
}

/// Build the relay router.
pub fn router() -> Router {
    Router::new()
        .route("/push/:id", post(push_message))
        .route("/pull/:id", get(pull_message))
        .with_state(RelayState::default())
}

async fn push_message(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Json(message): Json<SignalMessage>,
) -> StatusCode {
    let slot = state.slot(&id).await;
    let previous = slot.pending.lock().await.replace(message);
    if previous.is_some() {
        debug!(channel = %id, "overwrote unconsumed message");
    }
    slot.notify.notify_one();
    StatusCode::OK
}

async fn pull_message(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<Json<SignalMessage>, StatusCode> {
    let slot = state.slot(&id).await;
    let deadline = Instant::now() + PULL_WINDOW;

    loop {
        if let Some(message) = slot.pending.lock().await.take() {
            return Ok(Json(message));
        }
        tokio::select! {
            _ = slot.notify.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(StatusCode::REQUEST_TIMEOUT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_overwrite_keeps_latest() {
        let state = RelayState::default();
        let slot = state.slot("x").await;

        slot.pending
            .lock()
            .await
            .replace(SignalMessage::new().with("seq", "1"));
        slot.pending
            .lock()
            .await
            .replace(SignalMessage::new().with("seq", "2"));

        let taken = slot.pending.lock().await.take().unwrap();
        assert_eq!(taken.get("seq"), Some("2"));
        assert!(slot.pending.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_slots_are_per_channel() {
        let state = RelayState::default();
        let a = state.slot("a").await;
        let b = state.slot("b").await;
        a.pending
            .lock()
            .await
            .replace(SignalMessage::new().with("who", "a"));
        assert!(b.pending.lock().await.is_none());

        // Same id resolves to the same slot.
        let a_again = state.slot("a").await;
        assert!(a_again.pending.lock().await.is_some());
    }
}
