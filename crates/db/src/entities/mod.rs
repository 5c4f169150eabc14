//! Database entities.

#![allow(missing_docs)]

pub mod vote;

pub use vote::Entity as Vote;
