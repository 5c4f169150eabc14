//! Vote-state synchronization services.

#![allow(missing_docs)]

pub mod counts;
pub mod memory;
pub mod remote;
pub mod room_vote_store;
pub mod sync_reconciler;
pub mod vote_booth;
pub mod vote_lock;

pub use counts::{AggregateCounts, Choice, Percentages};
pub use memory::{InMemoryBroadcaster, InMemoryVoteBackend};
pub use remote::{
    BroadcastEvent, BroadcastMessage, Broadcaster, BroadcasterService, ChangeFeed,
    ChangeFeedService, VoteBackend, VoteBackendService,
};
pub use room_vote_store::{LockStoreService, RoomState, RoomVoteStore};
pub use sync_reconciler::{SyncOptions, SyncReconciler, Trigger, TriggerSource};
pub use vote_booth::{BallotOutcome, VoteBooth};
pub use vote_lock::{FileLockStore, LockChange, LockStore, MemoryLockStore, VoteLock};
