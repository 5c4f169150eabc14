//! Postgres change feed for vote rows.
//!
//! The `vote_change_notify` trigger publishes every insert and delete on the
//! `vote_changes` channel. [`VoteChangeListener`] holds one `LISTEN`
//! connection and fans the notifications out to per-room subscribers.
//! Delivery is best-effort: notifications raised while the connection is
//! being re-established are lost, which callers must tolerate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::sqlx::postgres::PgListener;
use serde::{Deserialize, Serialize};
use tally_common::{AppError, AppResult};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notification channel the trigger publishes on.
pub const VOTE_CHANGES_CHANNEL: &str = "vote_changes";

const ROOM_CHANNEL_CAPACITY: usize = 64;
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Delete,
}

/// One row change in a room. Carries no payload beyond "something changed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChange {
    pub op: ChangeOp,
    pub room_id: String,
}

type RoomSenders = Arc<RwLock<HashMap<String, broadcast::Sender<VoteChange>>>>;

/// Fans `vote_changes` notifications out to per-room subscribers.
pub struct VoteChangeListener {
    rooms: RoomSenders,
    task: JoinHandle<()>,
}

impl VoteChangeListener {
    /// Open a dedicated `LISTEN` connection and start dispatching.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let mut listener = PgListener::connect(database_url)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        listener
            .listen(VOTE_CHANGES_CHANNEL)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        info!(channel = VOTE_CHANGES_CHANNEL, "Listening for vote changes");

        let rooms: RoomSenders = Arc::new(RwLock::new(HashMap::new()));
        let dispatch_rooms = rooms.clone();

        let task = tokio::spawn(async move {
            loop {
                // PgListener reconnects and re-issues LISTEN on its own.
                match listener.recv().await {
                    Ok(notification) => {
                        dispatch(&dispatch_rooms, notification.payload()).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Vote change listener error, retrying");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                }
            }
        });

        Ok(Self { rooms, task })
    }

    /// Subscribe to changes in one room.
    pub async fn subscribe(&self, room_id: &str) -> broadcast::Receiver<VoteChange> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Stop listening. Subscribers see their channel close.
    pub async fn shutdown(&self) {
        self.task.abort();
        self.rooms.write().await.clear();
        info!("Vote change listener stopped");
    }
}

impl Drop for VoteChangeListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Parse one notification payload.
pub fn parse_payload(payload: &str) -> AppResult<VoteChange> {
    serde_json::from_str(payload).map_err(AppError::from)
}

async fn dispatch(rooms: &RoomSenders, payload: &str) {
    let change = match parse_payload(payload) {
        Ok(change) => change,
        Err(e) => {
            warn!(error = %e, payload, "Malformed vote change notification");
            return;
        }
    };

    let mut rooms = rooms.write().await;
    let Some(sender) = rooms.get(&change.room_id) else {
        return;
    };

    debug!(room = %change.room_id, op = ?change.op, "Vote change");
    if sender.send(change.clone()).is_err() {
        // Every subscriber of this room is gone.
        rooms.remove(&change.room_id);
    }
}
