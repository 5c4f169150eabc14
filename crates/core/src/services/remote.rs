//! Remote collaborators of the synchronization core.
//!
//! The core needs three things from the outside world: a durable store of
//! vote records, a change feed announcing writes to that store, and an
//! ephemeral broadcast channel between devices in the same room. Each is a
//! trait here so the store and reconciler can be driven by Postgres and Redis
//! in production and by [`super::memory`] in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_common::{AppResult, RoomId};
use tally_db::{VoteChange, VoteChangeListener, repositories::VoteRepository};
use tokio::sync::broadcast;

use super::counts::Choice;

/// Durable store of vote records.
#[async_trait]
pub trait VoteBackend: Send + Sync {
    /// Choices of every record in the room, in no particular order.
    async fn query(&self, room: &RoomId) -> AppResult<Vec<Choice>>;

    /// Create one record.
    async fn insert(&self, room: &RoomId, choice: Choice) -> AppResult<()>;

    /// Delete every record in the room, returning how many were removed.
    async fn delete_all(&self, room: &RoomId) -> AppResult<u64>;
}

/// At-least-once, possibly delayed notification of writes to a room.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Receive every insert and delete announced for `room` from now on.
    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<VoteChange>>;
}

/// Named broadcast events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastEvent {
    /// Someone cast a vote; refresh.
    Vote,
    /// Someone reset the room; drop the local lock and zero the counts.
    Reset,
}

/// Ephemeral message between devices in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: BroadcastEvent,
    /// Session id of the device that sent it.
    pub origin: String,
}

impl BroadcastMessage {
    #[must_use]
    pub fn new(event: BroadcastEvent, origin: impl Into<String>) -> Self {
        Self {
            event,
            origin: origin.into(),
        }
    }
}

/// Best-effort, non-durable pub/sub scoped to a room.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Send `message` to every device subscribed to `room`, this one included.
    async fn publish(&self, room: &RoomId, message: &BroadcastMessage) -> AppResult<()>;

    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<BroadcastMessage>>;

    /// Release the room once no local receiver is left.
    async fn unsubscribe(&self, room: &RoomId) -> AppResult<()>;
}

/// Shared handle to the vote record store.
pub type VoteBackendService = Arc<dyn VoteBackend>;

/// Shared handle to the change feed.
pub type ChangeFeedService = Arc<dyn ChangeFeed>;

/// Shared handle to the room broadcast.
pub type BroadcasterService = Arc<dyn Broadcaster>;

#[async_trait]
impl VoteBackend for VoteRepository {
    async fn query(&self, room: &RoomId) -> AppResult<Vec<Choice>> {
        let choices = self.find_choices_by_room(room.as_str()).await?;
        Ok(choices.into_iter().map(Choice::from).collect())
    }

    async fn insert(&self, room: &RoomId, choice: Choice) -> AppResult<()> {
        self.create(room.as_str(), choice.as_bool()).await?;
        Ok(())
    }

    async fn delete_all(&self, room: &RoomId) -> AppResult<u64> {
        self.delete_by_room(room.as_str()).await
    }
}

#[async_trait]
impl ChangeFeed for VoteChangeListener {
    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<VoteChange>> {
        Ok(VoteChangeListener::subscribe(self, room.as_str()).await)
    }
}
