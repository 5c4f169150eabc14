//! Server-Sent Events (SSE) for room state.

#![allow(missing_docs)]

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::{response::RoomResponse, state::AppState};

/// SSE event types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RoomStateEvent {
    /// Connection established.
    Connected,
    /// Current room state; sent on connect and after every change.
    State(RoomResponse),
}

impl RoomStateEvent {
    fn to_event(&self) -> Event {
        Event::default()
            .json_data(self)
            .unwrap_or_else(|_| Event::default().data("error"))
    }
}

/// Room state SSE stream.
async fn room_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let room = state.store.room().clone();
    let updates = WatchStream::new(state.store.subscribe()).map(move |snapshot| {
        Ok(RoomStateEvent::State(RoomResponse::new(&room, &snapshot)).to_event())
    });

    let initial = stream::once(async { Ok(RoomStateEvent::Connected.to_event()) });

    Sse::new(initial.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}

/// Create SSE router.
pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(room_stream))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tally_common::RoomId;
    use tally_core::{
        InMemoryBroadcaster, InMemoryVoteBackend, MemoryLockStore, RoomVoteStore,
    };
    use std::sync::Arc;

    #[test]
    fn test_connected_event_serialization() {
        let json = serde_json::to_string(&RoomStateEvent::Connected).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);
    }

    #[test]
    fn test_state_event_serialization() {
        let room = RoomId::parse("abc123").unwrap();
        let store = RoomVoteStore::new(
            room.clone(),
            Arc::new(InMemoryVoteBackend::new()),
            Arc::new(InMemoryBroadcaster::new()),
            Arc::new(MemoryLockStore::new()),
        );
        let event = RoomStateEvent::State(RoomResponse::new(&room, &store.snapshot()));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state\""));
        assert!(json.contains("\"room\":\"abc123\""));
        assert!(json.contains("\"resetSignal\":0"));
        assert!(json.contains("\"voted\":null"));
    }
}
