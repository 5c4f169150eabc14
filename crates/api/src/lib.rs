//! HTTP API layer for tally.
//!
//! Exposes one device session's view of its room to a local UI:
//!
//! - **Endpoints**: room state, cast a vote, reset the room
//! - **SSE**: a stream of room state on every change
//!
//! Built on Axum 0.8. Tracing and CORS layers are added by the server.

pub mod endpoints;
pub mod response;
pub mod sse;
pub mod state;

pub use endpoints::router;
pub use response::RoomResponse;
pub use sse::RoomStateEvent;
pub use state::AppState;
