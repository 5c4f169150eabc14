//! API endpoints.

mod room;

use axum::Router;

use crate::sse;
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new().merge(room::router()).merge(sse::router())
}
