// src/store/mod.rs
//! Durable poll records.
//!
//! `apply_vote` is the only operation that needs real atomicity: the open
//! check, the duplicate-identity check, the identity append and the option
//! increment happen as one unit, with "now" read inside that unit.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{NewPoll, OptionId, Poll, PollId, PollSummary, Tally};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of a terminate call. `changed` is false when the poll was already
/// terminated.
#[derive(Debug, Clone)]
pub struct Termination {
    pub poll: Poll,
    pub changed: bool,
}

#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    async fn create(&self, new_poll: NewPoll) -> Result<Poll, StoreError>;

    async fn get(&self, poll_id: PollId) -> Result<Poll, StoreError>;

    /// Fails with `Closed`, `OptionNotFound` or `AlreadyVoted` without
    /// touching the poll, and with `Conflict` when a concurrent writer won.
    async fn apply_vote(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        identity: &str,
    ) -> Result<Tally, StoreError>;

    async fn terminate(&self, poll_id: PollId) -> Result<Termination, StoreError>;

    /// Open polls, most recent first.
    async fn list_active(&self) -> Result<Vec<PollSummary>, StoreError>;
}
