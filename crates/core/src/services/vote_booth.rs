//! One vote per device.

use std::sync::Arc;

use serde::Serialize;
use tally_common::AppResult;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::counts::Choice;
use super::room_vote_store::RoomVoteStore;
use super::vote_lock::VoteLock;

/// Result of a ballot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "choice")]
pub enum BallotOutcome {
    /// The vote was recorded and the lock set.
    Recorded(Choice),
    /// The lock was already set; nothing was written.
    AlreadyVoted(Choice),
}

/// Enforces the device-local "vote once" rule on top of a [`RoomVoteStore`].
///
/// Attempts from this process are serialized so two concurrent requests
/// cannot both pass the lock check.
pub struct VoteBooth {
    store: Arc<RoomVoteStore>,
    ballot: Mutex<()>,
}

impl VoteBooth {
    /// Wrap `store`; the lock it reads and writes is the store's.
    #[must_use]
    pub fn new(store: Arc<RoomVoteStore>) -> Self {
        Self {
            store,
            ballot: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<RoomVoteStore> {
        &self.store
    }

    /// Cast `choice` unless this device already voted.
    ///
    /// The lock is set only after the insert succeeded, so a failed cast
    /// leaves the device free to try again.
    pub async fn vote(&self, choice: Choice) -> AppResult<BallotOutcome> {
        let _ballot = self.ballot.lock().await;

        if let VoteLock::Voted(previous) = self.store.lock().await? {
            info!(room = %self.store.room(), choice = %previous, "Already voted");
            return Ok(BallotOutcome::AlreadyVoted(previous));
        }

        self.store.cast_vote(choice).await?;

        if let Err(e) = self.store.record_lock(choice).await {
            // The vote is durable either way; only the duplicate guard is lost.
            error!(room = %self.store.room(), error = %e, "Failed to persist vote lock");
        }
        Ok(BallotOutcome::Recorded(choice))
    }

    /// Delete every vote in the room.
    pub async fn reset(&self) -> AppResult<()> {
        self.store.reset_votes().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::counts::AggregateCounts;
    use crate::services::memory::{InMemoryBroadcaster, InMemoryVoteBackend};
    use crate::services::vote_lock::{LockStore, MemoryLockStore};
    use tally_common::{AppError, RoomId};

    fn room() -> RoomId {
        RoomId::parse("booth1").unwrap()
    }

    fn booth(backend: &InMemoryVoteBackend, locks: &MemoryLockStore) -> VoteBooth {
        VoteBooth::new(Arc::new(RoomVoteStore::new(
            room(),
            Arc::new(backend.clone()),
            Arc::new(InMemoryBroadcaster::new()),
            Arc::new(locks.clone()),
        )))
    }

    #[tokio::test]
    async fn test_vote_sets_lock() {
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let booth = booth(&backend, &locks);

        let outcome = booth.vote(Choice::Yes).await.unwrap();

        assert_eq!(outcome, BallotOutcome::Recorded(Choice::Yes));
        assert_eq!(
            locks.get(&room().lock_key()).await.unwrap().as_deref(),
            Some("yes")
        );
        assert_eq!(booth.store().snapshot().lock(), VoteLock::Voted(Choice::Yes));
    }

    #[tokio::test]
    async fn test_second_vote_is_refused() {
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let booth = booth(&backend, &locks);

        booth.vote(Choice::No).await.unwrap();
        let outcome = booth.vote(Choice::Yes).await.unwrap();

        assert_eq!(outcome, BallotOutcome::AlreadyVoted(Choice::No));
        assert_eq!(backend.record_count(&room()).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_votes_record_once() {
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let booth = Arc::new(booth(&backend, &locks));

        let (first, second) = tokio::join!(booth.vote(Choice::Yes), booth.vote(Choice::No));

        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, BallotOutcome::Recorded(_)))
                .count(),
            1
        );
        assert_eq!(backend.record_count(&room()).await, 1);
    }

    #[tokio::test]
    async fn test_failed_vote_leaves_lock_unset() {
        let backend = InMemoryVoteBackend::new();
        backend.set_fail_inserts(true);
        let locks = MemoryLockStore::new();
        let booth = booth(&backend, &locks);

        let err = booth.vote(Choice::Yes).await.unwrap_err();

        assert!(matches!(err, AppError::Write(_)));
        assert!(locks.get(&room().lock_key()).await.unwrap().is_none());
        assert_eq!(booth.store().snapshot().counts(), AggregateCounts::default());

        backend.set_fail_inserts(false);
        let outcome = booth.vote(Choice::Yes).await.unwrap();
        assert_eq!(outcome, BallotOutcome::Recorded(Choice::Yes));
    }

    #[tokio::test]
    async fn test_reset_allows_voting_again() {
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let booth = booth(&backend, &locks);

        booth.vote(Choice::Yes).await.unwrap();
        booth.reset().await.unwrap();
        let outcome = booth.vote(Choice::No).await.unwrap();

        assert_eq!(outcome, BallotOutcome::Recorded(Choice::No));
        assert_eq!(backend.record_count(&room()).await, 1);
    }

    #[tokio::test]
    async fn test_cleared_storage_allows_revote() {
        // Device-local duplicate prevention only.
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let booth = booth(&backend, &locks);

        booth.vote(Choice::Yes).await.unwrap();
        locks.remove(&room().lock_key()).await.unwrap();
        booth.vote(Choice::Yes).await.unwrap();

        assert_eq!(backend.record_count(&room()).await, 2);
    }
}
