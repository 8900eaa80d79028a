#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use swiftpoll::clock::{Clock, ManualClock};
use swiftpoll::fanout::Fanout;
use swiftpoll::routes;
use swiftpoll::service::PollService;
use swiftpoll::store::MemoryStore;

pub struct TestApp {
    pub router: Router,
    pub clock: ManualClock,
}

pub fn app() -> TestApp {
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let service = PollService::new(
        Arc::new(MemoryStore::new(shared.clone())),
        Arc::new(Fanout::new(16)),
        shared,
    );

    TestApp {
        router: routes::create_routes(service),
        clock,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn vote_from(&self, origin: &str, poll_id: &str, option_id: &str) -> (StatusCode, Value) {
        self.send(
            Request::post("/api/vote")
                .header(CONTENT_TYPE, "application/json")
                .header("x-forwarded-for", origin)
                .body(Body::from(
                    serde_json::json!({ "pollId": poll_id, "optionId": option_id }).to_string(),
                ))
                .unwrap(),
        )
        .await
    }

    /// Creates a poll and returns its id and option ids in order.
    pub async fn create(&self, question: &str, options: &[&str], duration: Option<f64>) -> (String, Vec<String>) {
        let (status, body) = self
            .post(
                "/api/poll",
                serde_json::json!({ "question": question, "options": options, "duration": duration }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let id = body["id"].as_str().unwrap().to_string();

        let (_, poll) = self.get(&format!("/api/poll/{id}")).await;
        let option_ids = poll["options"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["id"].as_str().unwrap().to_string())
            .collect();
        (id, option_ids)
    }
}
