//! Redundant-channel reconciliation for one room.
//!
//! Four independent sources ask for the same thing, "re-read the room":
//!
//! - the backend change feed (insert/delete on the room's records),
//! - the room broadcast (`vote` from any device, `reset` from another one),
//! - a fixed-interval poll,
//! - changes to this room's lock key in the lock store.
//!
//! Each source runs as its own task and pushes a [`Trigger`] into one bounded
//! queue. A single worker drains the queue and calls
//! [`RoomVoteStore::fetch_counts`] or [`RoomVoteStore::apply_remote_reset`].
//! None of the sources is assumed reliable; the poll bounds how stale the
//! room can get when the other three are silent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tally_common::{AppResult, RoomId, config::SyncConfig};
use tally_db::VoteChange;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::remote::{BroadcastEvent, BroadcastMessage, BroadcasterService, ChangeFeedService};
use super::room_vote_store::RoomVoteStore;
use super::vote_lock::LockChange;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where a refresh request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Initial,
    ChangeFeed,
    Broadcast,
    Poll,
    LockChange,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::ChangeFeed => "change_feed",
            Self::Broadcast => "broadcast",
            Self::Poll => "poll",
            Self::LockChange => "lock_change",
        })
    }
}

/// One request for the reconciler worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Re-fetch the room's counts.
    Refresh(TriggerSource),
    /// Another device reset the room.
    RemoteReset,
}

/// Reconciler tuning.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Interval of the unconditional refresh.
    pub poll_interval: Duration,
    /// Capacity of the trigger queue.
    pub queue_capacity: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            queue_capacity: 16,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Sending half of the trigger queue.
#[derive(Clone)]
struct TriggerQueue(mpsc::Sender<Trigger>);

impl TriggerQueue {
    /// Queue a refresh, or drop it when the queue is full. Any refresh
    /// already queued covers it; when the queue holds only remote resets the
    /// change waits for the next poll. Returns `false` once the worker is gone.
    fn refresh(&self, source: TriggerSource) -> bool {
        match self.0.try_send(Trigger::Refresh(source)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(trigger = %source, "Trigger queue full, dropping refresh");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a remote reset. Never dropped.
    async fn reset(&self) -> bool {
        self.0.send(Trigger::RemoteReset).await.is_ok()
    }
}

/// Owns every subscription and timer keeping one room in sync.
///
/// Dropping the reconciler aborts its tasks; [`SyncReconciler::shutdown`]
/// additionally waits for them and releases the broadcast subscription.
pub struct SyncReconciler {
    room: RoomId,
    broadcaster: BroadcasterService,
    tasks: JoinSet<()>,
}

impl SyncReconciler {
    /// Subscribe to every source and start the worker.
    ///
    /// An initial refresh is queued before any source can fire.
    pub async fn start(
        store: Arc<RoomVoteStore>,
        change_feed: ChangeFeedService,
        broadcaster: BroadcasterService,
        options: SyncOptions,
    ) -> AppResult<Self> {
        let room = store.room().clone();
        let changes = change_feed.subscribe(&room).await?;
        let messages = broadcaster.subscribe(&room).await?;
        let lock_changes = store.lock_changes();

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let queue = TriggerQueue(tx);
        queue.refresh(TriggerSource::Initial);

        let mut tasks = JoinSet::new();
        tasks.spawn(run_worker(store.clone(), rx));
        tasks.spawn(forward_changes(changes, queue.clone()));
        tasks.spawn(forward_broadcasts(
            messages,
            store.session_id().to_string(),
            queue.clone(),
        ));
        tasks.spawn(run_poll(
            options.poll_interval.max(MIN_POLL_INTERVAL),
            queue.clone(),
        ));
        tasks.spawn(forward_lock_changes(lock_changes, room.lock_key(), queue));

        info!(
            room = %room,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Room sync started"
        );

        Ok(Self {
            room,
            broadcaster,
            tasks,
        })
    }

    /// Room being kept in sync.
    #[must_use]
    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    /// Stop every source and the worker together.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
        if let Err(e) = self.broadcaster.unsubscribe(&self.room).await {
            warn!(room = %self.room, error = %e, "Failed to unsubscribe from room broadcast");
        }
        info!(room = %self.room, "Room sync stopped");
    }
}

async fn run_worker(store: Arc<RoomVoteStore>, mut rx: mpsc::Receiver<Trigger>) {
    while let Some(trigger) = rx.recv().await {
        match trigger {
            Trigger::Refresh(source) => {
                debug!(room = %store.room(), trigger = %source, "Refreshing");
                // Failures are logged by the store; the next trigger retries.
                let _ = store.fetch_counts().await;
            }
            Trigger::RemoteReset => store.apply_remote_reset().await,
        }
    }
}

async fn forward_changes(mut changes: broadcast::Receiver<VoteChange>, queue: TriggerQueue) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                debug!(room = %change.room_id, op = ?change.op, "Change feed notification");
                if !queue.refresh(TriggerSource::ChangeFeed) {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change feed lagged");
                if !queue.refresh(TriggerSource::ChangeFeed) {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Change feed closed, relying on poll");
                queue.refresh(TriggerSource::ChangeFeed);
                return;
            }
        }
    }
}

async fn forward_broadcasts(
    mut messages: broadcast::Receiver<BroadcastMessage>,
    session_id: String,
    queue: TriggerQueue,
) {
    loop {
        let delivered = match messages.recv().await {
            Ok(message) => match message.event {
                BroadcastEvent::Vote => queue.refresh(TriggerSource::Broadcast),
                // Already applied locally by reset_votes.
                BroadcastEvent::Reset if message.origin == session_id => true,
                BroadcastEvent::Reset => queue.reset().await,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Room broadcast lagged");
                queue.refresh(TriggerSource::Broadcast)
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Room broadcast closed, relying on poll");
                queue.refresh(TriggerSource::Broadcast);
                return;
            }
        };
        if !delivered {
            return;
        }
    }
}

async fn run_poll(period: Duration, queue: TriggerQueue) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial refresh covers it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !queue.refresh(TriggerSource::Poll) {
            return;
        }
    }
}

async fn forward_lock_changes(
    mut changes: broadcast::Receiver<LockChange>,
    lock_key: String,
    queue: TriggerQueue,
) {
    loop {
        let relevant = match changes.recv().await {
            Ok(change) => change.key == lock_key,
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if relevant && !queue.refresh(TriggerSource::LockChange) {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::counts::{AggregateCounts, Choice};
    use crate::services::memory::{InMemoryBroadcaster, InMemoryVoteBackend};
    use crate::services::remote::{Broadcaster, VoteBackend};
    use crate::services::room_vote_store::RoomState;
    use crate::services::vote_lock::{LockStore, MemoryLockStore, VoteLock};
    use tokio::sync::watch;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn room() -> RoomId {
        RoomId::parse("sync01").unwrap()
    }

    struct Device {
        store: Arc<RoomVoteStore>,
        locks: MemoryLockStore,
        reconciler: SyncReconciler,
    }

    async fn device(
        backend: &InMemoryVoteBackend,
        broadcaster: &InMemoryBroadcaster,
        options: SyncOptions,
    ) -> Device {
        let locks = MemoryLockStore::new();
        let store = Arc::new(RoomVoteStore::new(
            room(),
            Arc::new(backend.clone()),
            Arc::new(broadcaster.clone()),
            Arc::new(locks.clone()),
        ));
        let reconciler = SyncReconciler::start(
            store.clone(),
            Arc::new(backend.clone()),
            Arc::new(broadcaster.clone()),
            options,
        )
        .await
        .unwrap();
        Device {
            store,
            locks,
            reconciler,
        }
    }

    fn slow_poll() -> SyncOptions {
        SyncOptions {
            poll_interval: Duration::from_secs(3600),
            ..SyncOptions::default()
        }
    }

    async fn wait_until(
        rx: &mut watch::Receiver<RoomState>,
        mut done: impl FnMut(&RoomState) -> bool,
    ) -> RoomState {
        *timeout(WAIT, rx.wait_for(|state| done(state)))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initial_refresh_loads_counts() {
        let backend = InMemoryVoteBackend::new();
        let broadcaster = InMemoryBroadcaster::new();
        backend.seed(&room(), [Choice::Yes, Choice::No, Choice::No]).await;

        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();

        let state = wait_until(&mut rx, |s| !s.is_loading()).await;
        assert_eq!(state.counts(), AggregateCounts::new(1, 2));
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_feed_refreshes_other_device() {
        let backend = InMemoryVoteBackend::new();
        let broadcaster = InMemoryBroadcaster::new();
        broadcaster.set_drop_messages(true);
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;

        // A write from elsewhere, announced only by the change feed.
        backend.insert(&room(), Choice::Yes).await.unwrap();

        let state = wait_until(&mut rx, |s| s.counts().yes == 1).await;
        assert_eq!(state.counts(), AggregateCounts::new(1, 0));
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_vote_broadcast_refreshes_other_device() {
        let backend = InMemoryVoteBackend::new();
        backend.set_feed_muted(true);
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let b = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;

        b.store.cast_vote(Choice::No).await.unwrap();

        let state = wait_until(&mut rx, |s| s.counts().no == 1).await;
        assert_eq!(state.counts(), AggregateCounts::new(0, 1));
        a.reconciler.shutdown().await;
        b.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_broadcast_clears_other_device_lock() {
        let backend = InMemoryVoteBackend::new();
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let b = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();

        a.store.cast_vote(Choice::Yes).await.unwrap();
        a.store.record_lock(Choice::Yes).await.unwrap();
        wait_until(&mut rx, |s| s.counts().yes == 1 && !s.is_loading()).await;

        b.store.reset_votes().await.unwrap();

        let state = wait_until(&mut rx, |s| s.reset_signal() >= 1).await;
        assert_eq!(state.counts(), AggregateCounts::default());
        assert_eq!(a.store.lock().await.unwrap(), VoteLock::NotVoted);
        assert!(a.locks.get(&room().lock_key()).await.unwrap().is_none());
        a.reconciler.shutdown().await;
        b.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_reset_echo_is_ignored() {
        let backend = InMemoryVoteBackend::new();
        backend.set_feed_muted(true);
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;

        a.store.reset_votes().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.store.snapshot().reset_signal(), 1);
        a.reconciler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_converges_without_notifications() {
        let backend = InMemoryVoteBackend::new();
        backend.set_feed_muted(true);
        let broadcaster = InMemoryBroadcaster::new();
        broadcaster.set_drop_messages(true);
        let options = SyncOptions::default();
        let a = device(&backend, &broadcaster, options).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;

        backend.seed(&room(), [Choice::Yes, Choice::Yes]).await;

        let state = timeout(options.poll_interval + Duration::from_millis(100), async {
            *rx.wait_for(|s| s.counts().yes == 2).await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(state.counts(), AggregateCounts::new(2, 0));
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_change_triggers_refresh() {
        let backend = InMemoryVoteBackend::new();
        backend.set_feed_muted(true);
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;
        let queries = backend.query_count();

        // Another context on this device writes the lock for an empty room.
        a.locks.set(&room().lock_key(), "yes").await.unwrap();

        let state = wait_until(&mut rx, |s| s.reset_signal() == 1).await;
        assert_eq!(state.lock(), VoteLock::NotVoted);
        assert!(backend.query_count() > queries);
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_lock_keys_are_ignored() {
        let backend = InMemoryVoteBackend::new();
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();
        wait_until(&mut rx, |s| !s.is_loading()).await;
        let queries = backend.query_count();

        a.locks.set("voted_elsewhere", "yes").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(backend.query_count(), queries);
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscriptions() {
        let backend = InMemoryVoteBackend::new();
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        assert_eq!(broadcaster.subscriber_count(&room()).await, 1);

        a.reconciler.shutdown().await;

        assert_eq!(broadcaster.subscriber_count(&room()).await, 0);
        let queries = backend.query_count();
        backend.insert(&room(), Choice::Yes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.query_count(), queries);
    }

    #[tokio::test]
    async fn test_fetch_failures_do_not_stop_sync() {
        let backend = InMemoryVoteBackend::new();
        backend.set_fail_queries(true);
        let broadcaster = InMemoryBroadcaster::new();
        let a = device(&backend, &broadcaster, slow_poll()).await;
        let mut rx = a.store.subscribe();

        backend.insert(&room(), Choice::No).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.store.snapshot().is_loading());

        backend.set_fail_queries(false);
        backend.insert(&room(), Choice::No).await.unwrap();

        let state = wait_until(&mut rx, |s| !s.is_loading()).await;
        assert_eq!(state.counts(), AggregateCounts::new(0, 2));
        a.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_refresh_but_keeps_resets() {
        let (tx, mut rx) = mpsc::channel(2);
        let queue = TriggerQueue(tx);

        assert!(queue.reset().await);
        assert!(queue.reset().await);
        assert!(queue.refresh(TriggerSource::ChangeFeed));

        assert_eq!(rx.recv().await, Some(Trigger::RemoteReset));
        assert_eq!(rx.recv().await, Some(Trigger::RemoteReset));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!queue.refresh(TriggerSource::Poll));
        assert!(!queue.reset().await);
    }

    #[test]
    fn test_options_from_config() {
        let options = SyncOptions::from(&SyncConfig {
            poll_interval_ms: 500,
            queue_capacity: 4,
        });
        assert_eq!(options.poll_interval, Duration::from_millis(500));
        assert_eq!(options.queue_capacity, 4);
    }
}
