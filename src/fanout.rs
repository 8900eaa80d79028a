// src/fanout.rs
//! Per-poll broadcast of tally changes.
//!
//! Each poll with at least one subscriber owns a `broadcast` channel. The
//! admission path publishes after a mutation commits; subscribers are plain
//! channel consumers. Delivery is best-effort: nothing is persisted, and a
//! subscriber that falls behind the channel capacity skips ahead. A channel is
//! removed as soon as its last subscription is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::models::PollId;
use crate::results::PollResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Snapshot,
    Vote,
    Terminated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Snapshot => "snapshot",
            EventKind::Vote => "vote",
            EventKind::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEvent {
    pub kind: EventKind,
    pub revision: u64,
    pub results: PollResults,
}

impl PollEvent {
    pub fn poll_id(&self) -> PollId {
        self.results.poll_id
    }
}

struct Channel {
    sender: broadcast::Sender<PollEvent>,
    last_revision: u64,
}

type Channels = Mutex<HashMap<PollId, Channel>>;

pub struct Fanout {
    channels: Arc<Channels>,
    capacity: usize,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, poll_id: PollId) -> Subscription {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let channel = channels.entry(poll_id).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            last_revision: 0,
        });

        Subscription {
            poll_id,
            receiver: channel.sender.subscribe(),
            last_revision: 0,
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Forwards the event to the poll's current subscribers and returns how
    /// many received it. Events older than the last one forwarded for the same
    /// poll are dropped, so writers finishing out of order cannot make a tally
    /// appear to go backwards.
    pub fn publish(&self, event: PollEvent) -> usize {
        let poll_id = event.poll_id();
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(channel) = channels.get_mut(&poll_id) else {
            return 0;
        };

        if channel.sender.receiver_count() == 0 {
            channels.remove(&poll_id);
            return 0;
        }

        if event.revision <= channel.last_revision {
            debug!(%poll_id, revision = event.revision, "dropping stale event");
            return 0;
        }

        channel.last_revision = event.revision;
        channel.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self, poll_id: PollId) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&poll_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of polls that currently hold a channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A consumer of one poll's events.
#[derive(Debug)]
pub struct Subscription {
    poll_id: PollId,
    receiver: broadcast::Receiver<PollEvent>,
    last_revision: u64,
    channels: Weak<Channels>,
}

impl Subscription {
    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    /// Ignore events at or below `revision`, typically the revision of a
    /// snapshot the subscriber already holds.
    pub fn skip_through(&mut self, revision: u64) {
        self.last_revision = self.last_revision.max(revision);
    }

    /// Next newer event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<PollEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.revision > self.last_revision => {
                    self.last_revision = event.revision;
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(poll_id = %self.poll_id, skipped, "subscriber lagged behind");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Our own receiver is still alive here.
        let last = channels
            .get(&self.poll_id)
            .is_some_and(|c| c.sender.receiver_count() <= 1);
        if last {
            channels.remove(&self.poll_id);
        }
    }
}
