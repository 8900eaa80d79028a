// src/results.rs
use serde::Serialize;

use crate::models::{OptionId, Poll, PollId, PollOption, Tally};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResults {
    pub poll_id: PollId,
    pub question: String,
    pub options: Vec<OptionResult>,
    pub total_votes: u64,
    pub is_open: bool,
    pub terminated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionResult {
    pub id: OptionId,
    pub text: String,
    pub votes: u64,
    pub percentage: u32,
}

/// Percentages are rounded per option and need not sum to 100.
pub fn percentage(votes: u64, total_votes: u64) -> u32 {
    if total_votes == 0 {
        return 0;
    }
    (votes as f64 / total_votes as f64 * 100.0).round() as u32
}

fn option_results(options: &[PollOption], total_votes: u64) -> Vec<OptionResult> {
    options
        .iter()
        .map(|option| OptionResult {
            id: option.id,
            text: option.text.clone(),
            votes: option.votes,
            percentage: percentage(option.votes, total_votes),
        })
        .collect()
}

pub fn project(poll: &Poll, is_open: bool) -> PollResults {
    let total_votes = poll.total_votes();

    PollResults {
        poll_id: poll.id,
        question: poll.question.clone(),
        options: option_results(&poll.options, total_votes),
        total_votes,
        is_open,
        terminated: poll.terminated,
    }
}

/// Results right after an admitted vote, when only the tally is fresh.
pub fn project_tally(question: &str, tally: &Tally, is_open: bool) -> PollResults {
    PollResults {
        poll_id: tally.poll_id,
        question: question.to_string(),
        options: option_results(&tally.options, tally.total_votes),
        total_votes: tally.total_votes,
        is_open,
        terminated: false,
    }
}
