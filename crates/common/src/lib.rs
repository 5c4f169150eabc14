//! Common utilities and shared types for tally.
//!
//! This crate provides foundational components used across all tally crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: room ids via [`RoomId`], record ids via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use tally_common::{AppResult, Config, RoomId};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let room = config.room.resolve_id()?;
//!     println!("Joined room: {room}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::{IdGenerator, RoomId};
