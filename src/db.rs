// src/db.rs
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS polls (
        id          UUID PRIMARY KEY,
        question    TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NULL,
        terminated  BOOLEAN NOT NULL DEFAULT FALSE,
        revision    BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS poll_options (
        id        UUID PRIMARY KEY,
        poll_id   UUID NOT NULL REFERENCES polls (id),
        position  INTEGER NOT NULL,
        text      TEXT NOT NULL,
        votes     BIGINT NOT NULL DEFAULT 0 CHECK (votes >= 0)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS poll_options_poll_idx ON poll_options (poll_id, position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS poll_votes (
        poll_id    UUID NOT NULL REFERENCES polls (id),
        identity   TEXT NOT NULL,
        option_id  UUID NOT NULL REFERENCES poll_options (id),
        voted_at   TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (poll_id, identity)
    )
    "#,
];

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Creates the tables if they are missing. Safe to run on every start.
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Database schema ready");
    Ok(())
}
