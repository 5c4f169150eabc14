//! Vote-state synchronization core for tally.
//!
//! A [`RoomVoteStore`] holds one device's view of a room and performs every
//! write; a [`SyncReconciler`] keeps that view converging on the remote
//! store through the change feed, the room broadcast, a poll, and local
//! lock changes. [`VoteBooth`] layers the "vote once per device" rule on top.

pub mod services;

pub use services::*;
