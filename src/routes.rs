// routes.rs
use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::service::PollService;

pub fn api_routes() -> Router<PollService> {
    Router::new()
        .route("/poll", post(handlers::create_poll))
        .route("/poll/{id}", get(handlers::get_poll))
        .route("/poll/{id}/terminate", post(handlers::terminate_poll))
        .route("/poll/{id}/events", get(handlers::poll_events))
        .route("/polls/active", get(handlers::list_active))
        .route("/vote", post(handlers::vote))
        .route("/results/{id}", get(handlers::get_results))
}

pub fn create_routes(service: PollService) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes())
        .with_state(service)
}
