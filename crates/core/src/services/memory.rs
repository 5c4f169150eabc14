//! Process-local collaborators.
//!
//! [`InMemoryVoteBackend`] is both a [`VoteBackend`] and its [`ChangeFeed`];
//! [`InMemoryBroadcaster`] plays the role of the cross-device pub/sub. Clones
//! share state, so several device sessions built on clones of the same
//! instances see one room. Each side can be told to fail or to silently drop
//! notifications, which is how the convergence tests model an unreliable
//! transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tally_common::{AppError, AppResult, RoomId};
use tally_db::{ChangeOp, VoteChange};
use tokio::sync::{RwLock, broadcast};

use super::counts::Choice;
use super::remote::{BroadcastMessage, Broadcaster, ChangeFeed, VoteBackend};

const ROOM_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct BackendInner {
    records: RwLock<HashMap<RoomId, Vec<Choice>>>,
    feeds: RwLock<HashMap<RoomId, broadcast::Sender<VoteChange>>>,
    fail_queries: AtomicBool,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
    mute_feed: AtomicBool,
    queries: AtomicUsize,
}

/// In-memory vote records with a change feed.
#[derive(Clone, Default)]
pub struct InMemoryVoteBackend {
    inner: Arc<BackendInner>,
}

impl InMemoryVoteBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with records, bypassing the change feed.
    pub async fn seed(&self, room: &RoomId, choices: impl IntoIterator<Item = Choice>) {
        self.inner
            .records
            .write()
            .await
            .entry(room.clone())
            .or_default()
            .extend(choices);
    }

    /// Number of records currently in the room.
    pub async fn record_count(&self, room: &RoomId) -> usize {
        self.inner
            .records
            .read()
            .await
            .get(room)
            .map_or(0, Vec::len)
    }

    /// Number of queries served so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.inner.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.inner.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Silently drop change notifications while `muted`.
    pub fn set_feed_muted(&self, muted: bool) {
        self.inner.mute_feed.store(muted, Ordering::SeqCst);
    }

    async fn announce(&self, room: &RoomId, op: ChangeOp) {
        if self.inner.mute_feed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = self.inner.feeds.read().await.get(room) {
            let _ = sender.send(VoteChange {
                op,
                room_id: room.to_string(),
            });
        }
    }
}

#[async_trait]
impl VoteBackend for InMemoryVoteBackend {
    async fn query(&self, room: &RoomId) -> AppResult<Vec<Choice>> {
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_queries.load(Ordering::SeqCst) {
            return Err(AppError::Database("query refused".to_string()));
        }
        Ok(self
            .inner
            .records
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert(&self, room: &RoomId, choice: Choice) -> AppResult<()> {
        if self.inner.fail_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Database("insert refused".to_string()));
        }
        self.inner
            .records
            .write()
            .await
            .entry(room.clone())
            .or_default()
            .push(choice);
        self.announce(room, ChangeOp::Insert).await;
        Ok(())
    }

    async fn delete_all(&self, room: &RoomId) -> AppResult<u64> {
        if self.inner.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::Database("delete refused".to_string()));
        }
        let removed = self
            .inner
            .records
            .write()
            .await
            .remove(room)
            .map_or(0, |records| records.len() as u64);
        if removed > 0 {
            self.announce(room, ChangeOp::Delete).await;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryVoteBackend {
    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<VoteChange>> {
        let mut feeds = self.inner.feeds.write().await;
        Ok(feeds
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe())
    }
}

#[derive(Default)]
struct BroadcasterInner {
    rooms: RwLock<HashMap<RoomId, broadcast::Sender<BroadcastMessage>>>,
    fail_publish: AtomicBool,
    drop_messages: AtomicBool,
}

/// In-memory room broadcast.
#[derive(Clone, Default)]
pub struct InMemoryBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl InMemoryBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` return an error.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Accept messages but deliver none of them.
    pub fn set_drop_messages(&self, drop: bool) {
        self.inner.drop_messages.store(drop, Ordering::SeqCst);
    }

    /// Number of live subscriptions to the room.
    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(room)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl Broadcaster for InMemoryBroadcaster {
    async fn publish(&self, room: &RoomId, message: &BroadcastMessage) -> AppResult<()> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::Redis("publish refused".to_string()));
        }
        if self.inner.drop_messages.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(sender) = self.inner.rooms.read().await.get(room) {
            let _ = sender.send(message.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, room: &RoomId) -> AppResult<broadcast::Receiver<BroadcastMessage>> {
        let mut rooms = self.inner.rooms.write().await;
        Ok(rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe())
    }

    async fn unsubscribe(&self, room: &RoomId) -> AppResult<()> {
        let mut rooms = self.inner.rooms.write().await;
        if rooms
            .get(room)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            rooms.remove(room);
        }
        Ok(())
    }
}
