use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header::AUTHORIZATION},
};
use chrono::NaiveDate;
use serde_json::{Value, json};
use server::{
    FLUSH_ROUTE,
    auth::Environment,
    build_router,
    config::Config,
    database::{MemoryCounterStore, ViewRecorder},
    keys::DIRTY_TOTALS,
    rollup::{MemoryRollupStore, RollupStore},
    state::State,
};
use tower::ServiceExt;

struct Harness {
    app: axum::Router,
    counters: Arc<MemoryCounterStore>,
    rollups: Arc<MemoryRollupStore>,
}

fn config(environment: Environment, secret: Option<&str>) -> Config {
    Config {
        port: 0,
        redis_url: String::new(),
        database_url: String::new(),
        db_max_connections: 1,
        environment,
        flush_secret: secret.map(str::to_string),
        allow_unauthenticated: false,
        batch_limit: None,
    }
}

fn harness(config: Config) -> Harness {
    let counters = Arc::new(MemoryCounterStore::new());
    let rollups = Arc::new(MemoryRollupStore::new());
    let state = State::with_stores(config, counters.clone(), rollups.clone());

    Harness {
        app: build_router(state),
        counters,
        rollups,
    }
}

async fn seed(counters: &MemoryCounterStore) {
    let day = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
    let recorder = ViewRecorder::new(counters);

    for _ in 0..5 {
        recorder.record("views:content:abc", day).await.unwrap();
    }
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    authorization: Option<&str>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);

    if let Some(value) = authorization {
        request = request.header(AUTHORIZATION, value);
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).expect("request should build"))
        .await
        .expect("response expected");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");

    let json = serde_json::from_slice::<Value>(&body).expect("body should be valid JSON");
    (status, json)
}

#[tokio::test]
async fn bearer_token_triggers_flush() {
    let harness = harness(config(Environment::Production, Some("s3cret")));
    seed(&harness.counters).await;

    let (status, body) = send(&harness.app, Method::POST, FLUSH_ROUTE, Some("Bearer s3cret")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "flushedTotals": 1, "flushedDaily": 1 }));

    let row = harness
        .rollups
        .get_total("views:content:abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.total, 5);

    let (status, body) = send(&harness.app, Method::GET, FLUSH_ROUTE, Some("Bearer s3cret")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "flushedTotals": 0, "flushedDaily": 0 }));
}

#[tokio::test]
async fn missing_credential_is_rejected_without_side_effects() {
    let harness = harness(config(Environment::Production, Some("s3cret")));
    seed(&harness.counters).await;
    let operations = harness.counters.operations();

    for authorization in [None, Some("Bearer wrong"), Some("s3cret")] {
        let (status, body) = send(&harness.app, Method::POST, FLUSH_ROUTE, authorization).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Unauthorized" }));
    }

    assert_eq!(harness.counters.operations(), operations);
    assert_eq!(harness.counters.value("views:content:abc").await, Some(5));
    assert_eq!(harness.rollups.writes(), 0);
}

#[tokio::test]
async fn query_token_only_outside_production() {
    let production = harness(config(Environment::Production, Some("s3cret")));
    let uri = format!("{FLUSH_ROUTE}?token=s3cret");

    let (status, _) = send(&production.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let development = harness(config(Environment::Development, Some("s3cret")));
    seed(&development.counters).await;

    let (status, body) = send(&development.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flushedTotals"], 1);
}

#[tokio::test]
async fn undecodable_query_falls_back_to_header() {
    let harness = harness(config(Environment::Production, Some("s3cret")));
    seed(&harness.counters).await;
    let uri = format!("{FLUSH_ROUTE}?token=a&token=b");

    let (status, body) = send(&harness.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Unauthorized" }));

    let (status, body) = send(&harness.app, Method::GET, &uri, Some("Bearer s3cret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "flushedTotals": 1, "flushedDaily": 1 }));
}

#[tokio::test]
async fn missing_secret_fails_closed_in_production() {
    let mut config = config(Environment::Production, None);
    config.allow_unauthenticated = true;
    let harness = harness(config);

    let (status, _) = send(&harness.app, Method::POST, FLUSH_ROUTE, Some("Bearer ")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&harness.app, Method::POST, FLUSH_ROUTE, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn store_failure_is_an_internal_error() {
    let harness = harness(config(Environment::Production, Some("s3cret")));
    seed(&harness.counters).await;
    harness.counters.set_unavailable(true);

    let (status, body) = send(&harness.app, Method::POST, FLUSH_ROUTE, Some("Bearer s3cret")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Internal error" }));

    harness.counters.set_unavailable(false);
    assert!(
        harness
            .counters
            .contains(DIRTY_TOTALS, "views:content:abc")
            .await
    );
    assert_eq!(harness.counters.value("views:content:abc").await, Some(5));
}

#[tokio::test]
async fn health_is_public() {
    let harness = harness(config(Environment::Production, None));

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("response expected");

    assert_eq!(response.status(), StatusCode::OK);
}
