// src/lifecycle.rs
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Poll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Open,
    Expired,
    Terminated,
}

/// Why a poll no longer admits votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosedReason {
    Expired,
    Terminated,
}

pub fn is_expired(poll: &Poll, now: DateTime<Utc>) -> bool {
    matches!(poll.expires_at, Some(expires_at) if now > expires_at)
}

pub fn is_open(poll: &Poll, now: DateTime<Utc>) -> bool {
    !poll.terminated && !is_expired(poll, now)
}

/// Termination wins over expiry when both apply.
pub fn status(poll: &Poll, now: DateTime<Utc>) -> PollStatus {
    if poll.terminated {
        PollStatus::Terminated
    } else if is_expired(poll, now) {
        PollStatus::Expired
    } else {
        PollStatus::Open
    }
}

pub fn closed_reason(poll: &Poll, now: DateTime<Utc>) -> Option<ClosedReason> {
    match status(poll, now) {
        PollStatus::Open => None,
        PollStatus::Expired => Some(ClosedReason::Expired),
        PollStatus::Terminated => Some(ClosedReason::Terminated),
    }
}
