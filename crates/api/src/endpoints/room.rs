//! Room endpoints.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Deserialize;
use tally_common::{AppError, AppResult};
use tally_core::{BallotOutcome, Choice};

use crate::{response::RoomResponse, state::AppState};

/// Vote request.
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    /// `true` for yes.
    pub choice: bool,
}

/// Get the room's counts and this device's vote.
async fn show(State(state): State<AppState>) -> AppResult<Json<RoomResponse>> {
    // Picks up lock changes made by other processes on this device.
    state.store.lock().await?;
    Ok(Json(state.room_response()))
}

/// Cast this device's vote.
async fn vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> AppResult<Json<RoomResponse>> {
    match state.booth.vote(Choice::from(req.choice)).await? {
        BallotOutcome::Recorded(_) => Ok(Json(state.room_response())),
        BallotOutcome::AlreadyVoted(_) => {
            Err(AppError::AlreadyVoted(state.store.room().to_string()))
        }
    }
}

/// Delete every vote in the room.
async fn reset(State(state): State<AppState>) -> AppResult<Json<RoomResponse>> {
    state.booth.reset().await?;
    Ok(Json(state.room_response()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/room", get(show))
        .route("/vote", post(vote))
        .route("/reset", post(reset))
}
