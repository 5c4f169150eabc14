//! Per-device view of one room's votes.
//!
//! [`RoomVoteStore`] is the only writer of vote records. It keeps the counts
//! last fetched from the backend (`confirmed`) apart from optimistic casts
//! whose insert has not completed yet (`pending`); observers see the sum.
//! Keeping the two apart makes a failed cast undo exactly its own increment,
//! whatever refreshes landed in the meantime.
//!
//! Every state change is a single `send_modify`/`send_if_modified` on the
//! watch channel, so no mutation ever observes a half-applied other one.

use std::sync::Arc;

use tally_common::{AppError, AppResult, IdGenerator, RoomId};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::counts::{AggregateCounts, Choice};
use super::remote::{BroadcastEvent, BroadcastMessage, BroadcasterService, VoteBackendService};
use super::vote_lock::{LockChange, LockStore, VoteLock};

/// Shared handle to the device's lock storage.
pub type LockStoreService = Arc<dyn LockStore>;

/// Observable state of a room on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomState {
    confirmed: AggregateCounts,
    pending: AggregateCounts,
    loading: bool,
    reset_signal: u64,
    casts_settled: u64,
    /// Successful fetches so far. Bumped without notifying observers.
    fetches_settled: u64,
    lock: VoteLock,
}

impl RoomState {
    const fn initial() -> Self {
        Self {
            confirmed: AggregateCounts::new(0, 0),
            pending: AggregateCounts::new(0, 0),
            loading: true,
            reset_signal: 0,
            casts_settled: 0,
            fetches_settled: 0,
            lock: VoteLock::NotVoted,
        }
    }

    /// Counts to display: the last fetch plus casts still in flight.
    #[must_use]
    pub const fn counts(&self) -> AggregateCounts {
        self.confirmed.plus(self.pending)
    }

    /// Whether a cast is still waiting for its insert.
    #[must_use]
    pub const fn has_pending_cast(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True until the first successful fetch or reset.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// Bumped once per reset seen by this device.
    #[must_use]
    pub const fn reset_signal(&self) -> u64 {
        self.reset_signal
    }

    /// Last known value of this device's vote lock.
    #[must_use]
    pub const fn lock(&self) -> VoteLock {
        self.lock
    }

    fn apply_reset(&mut self) {
        self.confirmed = AggregateCounts::default();
        self.loading = false;
        self.lock = VoteLock::NotVoted;
        self.reset_signal += 1;
    }
}

/// One optimistic cast between apply and settle.
///
/// Dropping it unsettled retracts the pending vote, which also covers a
/// caller that abandons `cast_vote` mid-flight.
struct PendingVote<'a> {
    state: &'a watch::Sender<RoomState>,
    choice: Choice,
    fetches_at_apply: u64,
    settled: bool,
}

impl<'a> PendingVote<'a> {
    fn apply(state: &'a watch::Sender<RoomState>, choice: Choice) -> Self {
        let mut fetches_at_apply = 0;
        state.send_modify(|s| {
            s.pending.record(choice);
            fetches_at_apply = s.fetches_settled;
        });
        Self {
            state,
            choice,
            fetches_at_apply,
            settled: false,
        }
    }

    /// The insert is durable: take the vote out of pending.
    ///
    /// It is added to the confirmed counts only when no fetch completed while
    /// the insert was in flight. Such a fetch may already have counted the new
    /// record, so the caller has to re-fetch instead. Returns whether the vote
    /// was folded in.
    fn confirm(mut self) -> bool {
        let (choice, fetches_at_apply) = (self.choice, self.fetches_at_apply);
        let mut folded = false;
        self.state.send_modify(|s| {
            s.pending.retract(choice);
            if s.fetches_settled == fetches_at_apply {
                s.confirmed.record(choice);
                folded = true;
            }
            s.casts_settled += 1;
        });
        self.settled = true;
        folded
    }
}

impl Drop for PendingVote<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let choice = self.choice;
            self.state.send_modify(|s| s.pending.retract(choice));
        }
    }
}

/// Local view of a room's aggregate counts and the single writer of its
/// vote records.
pub struct RoomVoteStore {
    room: RoomId,
    session_id: String,
    backend: VoteBackendService,
    broadcaster: BroadcasterService,
    locks: LockStoreService,
    state: watch::Sender<RoomState>,
}

impl RoomVoteStore {
    /// Create the store for `room`, starting in the loading state under a
    /// fresh session id. Nothing is fetched until the first refresh.
    pub fn new(
        room: RoomId,
        backend: VoteBackendService,
        broadcaster: BroadcasterService,
        locks: LockStoreService,
    ) -> Self {
        let (state, _) = watch::channel(RoomState::initial());
        Self {
            room,
            session_id: IdGenerator::new().generate_session_id(),
            backend,
            broadcaster,
            locks,
            state,
        }
    }

    /// Room this store tracks.
    #[must_use]
    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    /// Id stamped on this session's broadcasts.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.state.subscribe()
    }

    /// Current state without subscribing.
    #[must_use]
    pub fn snapshot(&self) -> RoomState {
        *self.state.borrow()
    }

    /// Re-read the room's records and replace the confirmed counts.
    ///
    /// Also repairs a stale lock: a device that believes it voted in a room
    /// with no records missed a reset, so the lock is cleared and the reset
    /// signal bumped. The repair is skipped when a cast was in flight or
    /// settled during the query, since the query may predate that insert.
    pub async fn fetch_counts(&self) -> AppResult<AggregateCounts> {
        let (settled_before, pending_before) = {
            let state = self.state.borrow();
            (state.casts_settled, state.has_pending_cast())
        };

        let choices = match self.backend.query(&self.room).await {
            Ok(choices) => choices,
            Err(e) => {
                warn!(room = %self.room, error = %e, "Failed to fetch vote counts");
                return Err(AppError::Fetch(e.to_string()));
            }
        };
        let fetched = AggregateCounts::from_choices(choices);
        let persisted = self.read_lock().await;

        let stale_lock = {
            let state = self.state.borrow();
            let lock = persisted.unwrap_or(state.lock);
            let cast_overlapped = pending_before
                || state.has_pending_cast()
                || state.casts_settled != settled_before;
            fetched.is_empty() && lock.has_voted() && !cast_overlapped
        };
        if stale_lock {
            info!(room = %self.room, "Vote lock set but room is empty, clearing stale lock");
            self.clear_lock().await;
        }

        self.state.send_if_modified(|state| {
            let before = *state;
            state.confirmed = fetched;
            state.loading = false;
            if let Some(lock) = persisted {
                state.lock = lock;
            }
            if stale_lock {
                state.lock = VoteLock::NotVoted;
                state.reset_signal += 1;
            }
            let changed = *state != before;
            state.fetches_settled += 1;
            changed
        });

        debug!(room = %self.room, yes = fetched.yes, no = fetched.no, "Fetched vote counts");
        Ok(fetched)
    }

    /// Cast one vote.
    ///
    /// The caller checks the lock beforehand and sets it only when this
    /// returns `Ok`; the store itself does not deduplicate.
    pub async fn cast_vote(&self, choice: Choice) -> AppResult<()> {
        let pending = PendingVote::apply(&self.state, choice);

        if let Err(e) = self.backend.insert(&self.room, choice).await {
            drop(pending);
            error!(room = %self.room, choice = %choice, error = %e, "Failed to cast vote");
            return Err(AppError::Write(e.to_string()));
        }
        if !pending.confirm() {
            debug!(room = %self.room, "Counts refreshed during cast, re-fetching");
            // A failed fetch is logged there; the next trigger settles the counts.
            let _ = self.fetch_counts().await;
        }

        info!(room = %self.room, choice = %choice, "Vote cast");
        self.announce(BroadcastEvent::Vote).await;
        Ok(())
    }

    /// Delete every vote in the room.
    pub async fn reset_votes(&self) -> AppResult<()> {
        let removed = match self.backend.delete_all(&self.room).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(room = %self.room, error = %e, "Failed to reset votes");
                return Err(AppError::Delete(e.to_string()));
            }
        };

        self.apply_reset().await;
        info!(room = %self.room, removed, "Votes reset");
        self.announce(BroadcastEvent::Reset).await;
        Ok(())
    }

    /// Handle a reset announced by another device.
    pub async fn apply_remote_reset(&self) {
        info!(room = %self.room, "Room reset by another device");
        self.apply_reset().await;
    }

    /// Current value of this device's vote lock.
    pub async fn lock(&self) -> AppResult<VoteLock> {
        let raw = self.locks.get(&self.room.lock_key()).await?;
        let lock = VoteLock::from_stored(raw.as_deref());
        self.state.send_if_modified(|state| {
            let changed = state.lock != lock;
            state.lock = lock;
            changed
        });
        Ok(lock)
    }

    /// Persist that this device's vote is recorded.
    pub async fn record_lock(&self, choice: Choice) -> AppResult<()> {
        self.locks.set(&self.room.lock_key(), choice.as_str()).await?;
        self.state.send_if_modified(|state| {
            let lock = VoteLock::Voted(choice);
            let changed = state.lock != lock;
            state.lock = lock;
            changed
        });
        Ok(())
    }

    /// Changes to any key of the underlying lock store.
    #[must_use]
    pub fn lock_changes(&self) -> broadcast::Receiver<LockChange> {
        self.locks.watch()
    }

    async fn apply_reset(&self) {
        self.clear_lock().await;
        self.state.send_modify(RoomState::apply_reset);
    }

    async fn read_lock(&self) -> Option<VoteLock> {
        match self.locks.get(&self.room.lock_key()).await {
            Ok(raw) => Some(VoteLock::from_stored(raw.as_deref())),
            Err(e) => {
                warn!(room = %self.room, error = %e, "Failed to read vote lock");
                None
            }
        }
    }

    async fn clear_lock(&self) {
        if let Err(e) = self.locks.remove(&self.room.lock_key()).await {
            warn!(room = %self.room, error = %e, "Failed to clear vote lock");
        }
    }

    async fn announce(&self, event: BroadcastEvent) {
        let message = BroadcastMessage::new(event, self.session_id.clone());
        if let Err(e) = self.broadcaster.publish(&self.room, &message).await {
            warn!(room = %self.room, event = ?event, error = %e, "Failed to broadcast");
        }
    }
}
