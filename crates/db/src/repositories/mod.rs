//! Repositories wrapping entity queries.

mod vote;

pub use vote::VoteRepository;
