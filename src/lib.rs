//! Anonymous polls with one vote per network origin and live results.
//!
//! A vote passes through the admission checks in [`service::PollService`],
//! is applied atomically by a [`store::PollStore`], and the new tally is
//! broadcast to the poll's subscribers through [`fanout::Fanout`].
//!
//! Identity is the first `X-Forwarded-For` entry or the peer address. It is a
//! duplicate-vote heuristic only; clients may remember that they voted, but
//! only the server-side check decides.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod results;
pub mod routes;
pub mod service;
pub mod store;

use std::sync::Arc;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use clock::{Clock, SystemClock};
use config::Config;
use fanout::Fanout;
use service::{PollService, RetryPolicy};
use store::{MemoryStore, PgStore, PollStore};

/// Picks PostgreSQL when `DATABASE_URL` is set, memory otherwise.
pub async fn build_service(config: &Config) -> Result<PollService, sqlx::Error> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn PollStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.database_max_connections).await?;
            db::init_schema(&pool).await?;
            info!("Using PostgreSQL poll store");
            Arc::new(PgStore::new(pool, clock.clone()))
        }
        None => {
            info!("DATABASE_URL not set, polls are kept in memory");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let fanout = Arc::new(Fanout::new(config.event_channel_capacity));
    Ok(
        PollService::new(store, fanout, clock).with_retry_policy(RetryPolicy {
            retries: config.vote_retries,
            backoff: config.vote_retry_backoff,
        }),
    )
}

pub fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    match origin {
        "*" => cors.allow_origin(Any),
        origin => match origin.parse::<HeaderValue>() {
            Ok(value) => cors.allow_origin(value),
            Err(_) => {
                tracing::warn!("CORS_ORIGIN {origin:?} is not a valid header value, allowing any");
                cors.allow_origin(Any)
            }
        },
    }
}

pub fn build_app(service: PollService, config: &Config) -> Router {
    routes::create_routes(service)
        .layer(cors_layer(&config.cors_origin))
        .layer(TraceLayer::new_for_http())
}
