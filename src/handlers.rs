// handlers.rs
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{PollError, PollResult};
use crate::fanout::{EventKind, PollEvent};
use crate::identity::VoterIdentity;
use crate::models::{
    CreatePollRequest, CreatePollResponse, MessageResponse, PollId, PollSummary, PollView, Tally,
    VoteRequest,
};
use crate::results::PollResults;
use crate::service::PollService;

fn parse_poll_id(raw: &str) -> PollResult<PollId> {
    raw.parse().map_err(|_| PollError::NotFound)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> PollResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| PollError::Validation(rejection.body_text()))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Create a poll from a question, at least two options and an optional
/// duration in minutes
pub async fn create_poll(
    State(service): State<PollService>,
    payload: Result<Json<CreatePollRequest>, JsonRejection>,
) -> PollResult<(StatusCode, Json<CreatePollResponse>)> {
    let request = json_body(payload)?;
    let poll = service
        .create_poll(&request.question, &request.options, request.duration)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePollResponse {
            id: poll.id,
            message: "Poll created successfully!".to_string(),
        }),
    ))
}

/// Poll details for the voting view
pub async fn get_poll(
    State(service): State<PollService>,
    Path(poll_id): Path<String>,
) -> PollResult<Json<PollView>> {
    let poll_id = parse_poll_id(&poll_id)?;
    Ok(Json(service.get_poll(poll_id).await?))
}

pub async fn list_active(State(service): State<PollService>) -> PollResult<Json<Vec<PollSummary>>> {
    Ok(Json(service.list_active().await?))
}

/// Vote for an option; the voter is identified by network origin only
pub async fn vote(
    State(service): State<PollService>,
    identity: VoterIdentity,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> PollResult<Json<Tally>> {
    let request = json_body(payload)?;
    let tally = service
        .submit_vote_with_retry(request.poll_id, request.option_id, identity.as_str())
        .await?;

    Ok(Json(tally))
}

pub async fn get_results(
    State(service): State<PollService>,
    Path(poll_id): Path<String>,
) -> PollResult<Json<PollResults>> {
    let poll_id = parse_poll_id(&poll_id)?;
    Ok(Json(service.get_results(poll_id).await?))
}

pub async fn terminate_poll(
    State(service): State<PollService>,
    Path(poll_id): Path<String>,
) -> PollResult<Json<MessageResponse>> {
    let poll_id = parse_poll_id(&poll_id)?;
    service.terminate(poll_id).await?;

    Ok(Json(MessageResponse {
        message: "Poll terminated".to_string(),
    }))
}

fn to_sse(event: &PollEvent) -> Event {
    let sse = Event::default()
        .event(event.kind.as_str())
        .id(event.revision.to_string());

    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            warn!("failed to encode poll event: {e}");
            sse.comment("encoding failed")
        }
    }
}

/// Live results: a snapshot first, then one event per vote. The stream ends
/// after the poll is terminated.
pub async fn poll_events(
    State(service): State<PollService>,
    Path(poll_id): Path<String>,
) -> PollResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let poll_id = parse_poll_id(&poll_id)?;
    let (snapshot, subscription) = service.subscribe(poll_id).await?;

    let already_over = snapshot.results.terminated;
    let first = stream::once(async move { Ok::<_, Infallible>(to_sse(&snapshot)) });
    let updates = stream::unfold(
        (!already_over).then_some(subscription),
        |state| async move {
            let mut subscription = state?;
            let event = subscription.recv().await?;
            let next = (event.kind != EventKind::Terminated).then_some(subscription);
            Some((Ok(to_sse(&event)), next))
        },
    );

    Ok(Sse::new(first.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
