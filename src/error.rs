// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::lifecycle::ClosedReason;

/// Failures at the storage seam. Mutations that fail leave the poll untouched.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("poll not found")]
    NotFound,

    #[error("poll is closed ({0:?})")]
    Closed(ClosedReason),

    #[error("option not found")]
    OptionNotFound,

    #[error("identity has already voted")]
    AlreadyVoted,

    #[error("concurrent update lost the race")]
    Conflict,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("{0}")]
    Validation(String),

    #[error("Poll not found")]
    NotFound,

    #[error("{}", closed_message(.0))]
    Closed(ClosedReason),

    #[error("Option not found")]
    OptionNotFound,

    #[error("You have already voted on this poll")]
    AlreadyVoted,

    #[error("The poll was updated concurrently, try again")]
    StorageConflict,

    #[error("Storage failure: {0}")]
    Storage(String),
}

fn closed_message(reason: &ClosedReason) -> &'static str {
    match reason {
        ClosedReason::Expired => "This poll has expired and is no longer accepting votes",
        ClosedReason::Terminated => "This poll has been ended by its creator",
    }
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => PollError::NotFound,
            StoreError::Closed(reason) => PollError::Closed(reason),
            StoreError::OptionNotFound => PollError::OptionNotFound,
            StoreError::AlreadyVoted => PollError::AlreadyVoted,
            StoreError::Conflict => PollError::StorageConflict,
            StoreError::Database(e) => PollError::Storage(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl PollError {
    pub fn code(&self) -> &'static str {
        match self {
            PollError::Validation(_) => "VALIDATION_ERROR",
            PollError::NotFound => "NOT_FOUND",
            PollError::Closed(ClosedReason::Expired) => "POLL_EXPIRED",
            PollError::Closed(ClosedReason::Terminated) => "POLL_TERMINATED",
            PollError::OptionNotFound => "OPTION_NOT_FOUND",
            PollError::AlreadyVoted => "ALREADY_VOTED",
            PollError::StorageConflict => "STORAGE_CONFLICT",
            PollError::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PollError::Validation(_) => StatusCode::BAD_REQUEST,
            PollError::NotFound | PollError::OptionNotFound => StatusCode::NOT_FOUND,
            PollError::Closed(_) => StatusCode::GONE,
            PollError::AlreadyVoted => StatusCode::CONFLICT,
            PollError::StorageConflict => StatusCode::SERVICE_UNAVAILABLE,
            PollError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let message = match &self {
            PollError::Storage(msg) => {
                error!("storage failure: {msg}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };

        (self.status(), Json(body)).into_response()
    }
}

pub type PollResult<T> = Result<T, PollError>;
