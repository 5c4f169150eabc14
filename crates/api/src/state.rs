//! Shared handler state.

use std::sync::Arc;

use tally_core::{RoomVoteStore, VoteBooth};

use crate::response::RoomResponse;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RoomVoteStore>,
    pub booth: Arc<VoteBooth>,
}

impl AppState {
    /// Build handler state around a store; the booth wraps the same store.
    #[must_use]
    pub fn new(store: Arc<RoomVoteStore>) -> Self {
        let booth = Arc::new(VoteBooth::new(store.clone()));
        Self { store, booth }
    }

    /// Current room state as returned by the endpoints.
    #[must_use]
    pub fn room_response(&self) -> RoomResponse {
        RoomResponse::new(self.store.room(), &self.store.snapshot())
    }
}
