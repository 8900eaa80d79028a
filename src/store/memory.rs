// src/store/memory.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::lifecycle;
use crate::models::{NewPoll, OptionId, Poll, PollId, PollOption, PollSummary, Tally};
use crate::store::{PollStore, Termination};

/// Keeps polls in process memory. Each poll sits behind its own mutex, so
/// votes on one poll serialize while different polls proceed in parallel.
pub struct MemoryStore {
    polls: RwLock<HashMap<PollId, Arc<Mutex<Poll>>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            polls: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn entry(&self, poll_id: PollId) -> Result<Arc<Mutex<Poll>>, StoreError> {
        self.polls
            .read()
            .await
            .get(&poll_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn create(&self, new_poll: NewPoll) -> Result<Poll, StoreError> {
        let poll = Poll {
            id: PollId::new(),
            question: new_poll.question,
            options: new_poll
                .options
                .into_iter()
                .map(|text| PollOption {
                    id: OptionId::new(),
                    text,
                    votes: 0,
                })
                .collect(),
            created_at: self.clock.now(),
            expires_at: new_poll.expires_at,
            terminated: false,
            revision: 0,
            voted_identities: BTreeSet::new(),
        };

        self.polls
            .write()
            .await
            .insert(poll.id, Arc::new(Mutex::new(poll.clone())));

        Ok(poll)
    }

    async fn get(&self, poll_id: PollId) -> Result<Poll, StoreError> {
        let entry = self.entry(poll_id).await?;
        let poll = entry.lock().await;
        Ok(poll.clone())
    }

    async fn apply_vote(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        identity: &str,
    ) -> Result<Tally, StoreError> {
        let entry = self.entry(poll_id).await?;
        let mut poll = entry.lock().await;

        let now = self.clock.now();
        if let Some(reason) = lifecycle::closed_reason(&poll, now) {
            return Err(StoreError::Closed(reason));
        }
        let index = poll
            .options
            .iter()
            .position(|o| o.id == option_id)
            .ok_or(StoreError::OptionNotFound)?;
        if poll.has_voted(identity) {
            return Err(StoreError::AlreadyVoted);
        }

        poll.options[index].votes += 1;
        poll.voted_identities.insert(identity.to_string());
        poll.revision += 1;

        Ok(poll.tally())
    }

    async fn terminate(&self, poll_id: PollId) -> Result<Termination, StoreError> {
        let entry = self.entry(poll_id).await?;
        let mut poll = entry.lock().await;

        let changed = !poll.terminated;
        if changed {
            poll.terminated = true;
            poll.revision += 1;
        }

        Ok(Termination {
            poll: poll.clone(),
            changed,
        })
    }

    async fn list_active(&self) -> Result<Vec<PollSummary>, StoreError> {
        let entries: Vec<_> = self.polls.read().await.values().cloned().collect();
        let now = self.clock.now();

        let mut active = Vec::new();
        for entry in entries {
            let poll = entry.lock().await;
            if lifecycle::is_open(&poll, now) {
                active.push(PollSummary::from(&*poll));
            }
        }
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(active)
    }
}
