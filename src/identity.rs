// src/identity.rs
//! Voter identity taken from the request's network origin.
//!
//! This is a weak duplicate-vote heuristic, not authentication: voters behind
//! one gateway share an identity and anyone can change origin to vote again.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::ErrorResponse;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterIdentity(pub String);

impl VoterIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// First non-empty entry of `X-Forwarded-For`, falling back to the peer
/// address.
pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    match forwarded {
        Some(first) => Some(first.to_string()),
        None => peer.map(|addr| addr.ip().to_string()),
    }
}

impl<S> FromRequestParts<S> for VoterIdentity
where
    S: Send + Sync,
{
    type Rejection = IdentityRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        resolve(&parts.headers, peer)
            .map(VoterIdentity)
            .ok_or(IdentityRejection)
    }
}

#[derive(Debug)]
pub struct IdentityRejection;

impl IntoResponse for IdentityRejection {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: "IDENTITY_UNAVAILABLE".to_string(),
            message: "Could not determine where the vote came from".to_string(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}
