// src/store/postgres.rs
//! PostgreSQL-backed store.
//!
//! A vote runs in one transaction: the poll row is locked with `FOR UPDATE`,
//! the lifecycle is judged against the clock after the lock is held, and the
//! `(poll_id, identity)` primary key on `poll_votes` rejects a second vote
//! from the same identity even across server instances.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::lifecycle;
use crate::models::{NewPoll, OptionId, Poll, PollId, PollOption, PollSummary, Tally};
use crate::store::{PollStore, Termination};

#[derive(Debug, sqlx::FromRow)]
struct PollRow {
    id: Uuid,
    question: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    terminated: bool,
    revision: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OptionRow {
    id: Uuid,
    text: String,
    votes: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    question: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Maps lost races to `Conflict` so the caller can retry.
fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                warn!("vote transaction lost a race: {}", db_err.message());
                return StoreError::Conflict;
            }
            Some(UNIQUE_VIOLATION) => return StoreError::Conflict,
            _ => {}
        }
    }
    StoreError::Database(err)
}

pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn load(
        tx: &mut Transaction<'_, Postgres>,
        row: PollRow,
    ) -> Result<Poll, sqlx::Error> {
        let options = Self::load_options(tx, row.id).await?;

        let identities: Vec<String> =
            sqlx::query_scalar("SELECT identity FROM poll_votes WHERE poll_id = $1")
                .bind(row.id)
                .fetch_all(&mut **tx)
                .await?;

        Ok(Poll {
            id: PollId(row.id),
            question: row.question,
            options,
            created_at: row.created_at,
            expires_at: row.expires_at,
            terminated: row.terminated,
            revision: row.revision as u64,
            voted_identities: identities.into_iter().collect::<BTreeSet<_>>(),
        })
    }

    async fn load_options(
        tx: &mut Transaction<'_, Postgres>,
        poll_id: Uuid,
    ) -> Result<Vec<PollOption>, sqlx::Error> {
        let rows = sqlx::query_as::<_, OptionRow>(
            "SELECT id, text, votes FROM poll_options WHERE poll_id = $1 ORDER BY position",
        )
        .bind(poll_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PollOption {
                id: OptionId(row.id),
                text: row.text,
                votes: row.votes as u64,
            })
            .collect())
    }

    async fn fetch_row(
        tx: &mut Transaction<'_, Postgres>,
        poll_id: PollId,
        for_update: bool,
    ) -> Result<Option<PollRow>, sqlx::Error> {
        let sql = if for_update {
            "SELECT id, question, created_at, expires_at, terminated, revision \
             FROM polls WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT id, question, created_at, expires_at, terminated, revision \
             FROM polls WHERE id = $1"
        };

        sqlx::query_as::<_, PollRow>(sql)
            .bind(poll_id.0)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Reads the poll, its options and its voters from one snapshot.
    async fn snapshot(&self, poll_id: PollId) -> Result<Poll, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = Self::fetch_row(&mut tx, poll_id, false)
            .await?
            .ok_or(StoreError::NotFound)?;
        let poll = Self::load(&mut tx, row).await?;
        tx.commit().await?;

        Ok(poll)
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn create(&self, new_poll: NewPoll) -> Result<Poll, StoreError> {
        let poll_id = PollId::new();
        let created_at = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO polls (id, question, created_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(poll_id.0)
        .bind(&new_poll.question)
        .bind(created_at)
        .bind(new_poll.expires_at)
        .execute(&mut *tx)
        .await?;

        let mut options = Vec::with_capacity(new_poll.options.len());
        for (position, text) in new_poll.options.into_iter().enumerate() {
            let option_id = OptionId::new();
            sqlx::query(
                "INSERT INTO poll_options (id, poll_id, position, text) VALUES ($1, $2, $3, $4)",
            )
            .bind(option_id.0)
            .bind(poll_id.0)
            .bind(position as i32)
            .bind(&text)
            .execute(&mut *tx)
            .await?;

            options.push(PollOption {
                id: option_id,
                text,
                votes: 0,
            });
        }

        tx.commit().await?;

        Ok(Poll {
            id: poll_id,
            question: new_poll.question,
            options,
            created_at,
            expires_at: new_poll.expires_at,
            terminated: false,
            revision: 0,
            voted_identities: BTreeSet::new(),
        })
    }

    async fn get(&self, poll_id: PollId) -> Result<Poll, StoreError> {
        self.snapshot(poll_id).await
    }

    async fn apply_vote(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        identity: &str,
    ) -> Result<Tally, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = Self::fetch_row(&mut tx, poll_id, true)
            .await
            .map_err(classify)?
            .ok_or(StoreError::NotFound)?;

        let now = self.clock.now();
        if row.terminated {
            return Err(StoreError::Closed(lifecycle::ClosedReason::Terminated));
        }
        if matches!(row.expires_at, Some(expires_at) if now > expires_at) {
            return Err(StoreError::Closed(lifecycle::ClosedReason::Expired));
        }

        let known_option: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM poll_options WHERE id = $1 AND poll_id = $2")
                .bind(option_id.0)
                .bind(poll_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(classify)?;
        if known_option.is_none() {
            return Err(StoreError::OptionNotFound);
        }

        let inserted = sqlx::query(
            "INSERT INTO poll_votes (poll_id, identity, option_id, voted_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (poll_id, identity) DO NOTHING",
        )
        .bind(poll_id.0)
        .bind(identity)
        .bind(option_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyVoted);
        }

        sqlx::query("UPDATE poll_options SET votes = votes + 1 WHERE id = $1")
            .bind(option_id.0)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let revision: i64 = sqlx::query_scalar(
            "UPDATE polls SET revision = revision + 1 WHERE id = $1 RETURNING revision",
        )
        .bind(poll_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        let options = Self::load_options(&mut tx, poll_id.0)
            .await
            .map_err(classify)?;
        let total_votes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM poll_votes WHERE poll_id = $1")
            .bind(poll_id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        Ok(Tally {
            poll_id,
            revision: revision as u64,
            options,
            total_votes: total_votes as u64,
        })
    }

    async fn terminate(&self, poll_id: PollId) -> Result<Termination, StoreError> {
        let updated: Option<Uuid> = sqlx::query_scalar(
            "UPDATE polls SET terminated = TRUE, revision = revision + 1 \
             WHERE id = $1 AND NOT terminated RETURNING id",
        )
        .bind(poll_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let poll = self.snapshot(poll_id).await?;

        Ok(Termination {
            poll,
            changed: updated.is_some(),
        })
    }

    async fn list_active(&self) -> Result<Vec<PollSummary>, StoreError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, question, created_at, expires_at FROM polls \
             WHERE NOT terminated AND (expires_at IS NULL OR expires_at >= $1) \
             ORDER BY created_at DESC",
        )
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PollSummary {
                id: PollId(row.id),
                question: row.question,
                created_at: row.created_at,
                expires_at: row.expires_at,
            })
            .collect())
    }
}
