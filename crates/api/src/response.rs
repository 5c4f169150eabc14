//! API response types.

use serde::Serialize;
use tally_common::RoomId;
use tally_core::{AggregateCounts, Choice, Percentages, RoomState};

/// Yes/no totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountsResponse {
    pub yes: u64,
    pub no: u64,
}

impl From<AggregateCounts> for CountsResponse {
    fn from(counts: AggregateCounts) -> Self {
        Self {
            yes: counts.yes,
            no: counts.no,
        }
    }
}

/// Room state as seen by this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub room: String,
    pub counts: CountsResponse,
    pub total: u64,
    pub percentages: Percentages,
    pub loading: bool,
    pub reset_signal: u64,
    /// This device's vote, `null` when it has not voted.
    pub voted: Option<Choice>,
}

impl RoomResponse {
    #[must_use]
    pub fn new(room: &RoomId, state: &RoomState) -> Self {
        let counts = state.counts();
        Self {
            room: room.to_string(),
            counts: counts.into(),
            total: counts.total(),
            percentages: counts.percentages(),
            loading: state.is_loading(),
            reset_signal: state.reset_signal(),
            voted: state.lock().choice(),
        }
    }
}
