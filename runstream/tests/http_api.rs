#![cfg(feature = "http")]
//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use runstream::http::{router, AppState};
use runstream::*;
use runstream_testkit::{test_config, TestService, TEST_ASSISTANT};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

async fn app() -> (TestService, Router) {
    let ts = TestService::start(test_config()).await.unwrap();
    let app = router(AppState::new(ts.service.clone()));
    (ts, app)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = tokio::time::timeout(Duration::from_secs(5), app.clone().oneshot(request))
        .await
        .expect("request timed out")
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("body timed out")
    .unwrap();
    (status, headers, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(app, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

async fn new_thread(app: &Router) -> String {
    let (status, thread) = send_json(app, json_request(Method::POST, "/threads", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    thread["thread_id"].as_str().unwrap().to_string()
}

fn run_body(message: &str, script: Value) -> Value {
    json!({
        "assistant_id": TEST_ASSISTANT,
        "input": { "message": message, "script": script },
    })
}

#[tokio::test]
async fn test_health() {
    let (ts, app) = app().await;
    let (status, body) = send_json(&app, empty_request(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
    ts.shutdown().await;
}

#[tokio::test]
async fn test_create_run_sets_content_location() {
    let (ts, app) = app().await;
    let thread_id = new_thread(&app).await;

    let (status, headers, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs"),
            run_body("hi", Value::Null),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let run: Value = serde_json::from_slice(&body).unwrap();
    let run_id = run["run_id"].as_str().unwrap();
    assert_eq!(run["thread_id"], thread_id.as_str());
    assert_eq!(
        headers[header::CONTENT_LOCATION],
        format!("/threads/{thread_id}/runs/{run_id}").as_str()
    );

    let (status, fetched) = send_json(
        &app,
        empty_request(Method::GET, &format!("/threads/{thread_id}/runs/{run_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["run_id"], run_id);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_wait_returns_final_values_as_json() {
    let (ts, app) = app().await;
    let thread_id = new_thread(&app).await;

    let (status, headers, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/wait"),
            run_body("wait for me", json!({ "steps": 1 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let output: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(output["messages"][1]["content"], "echo: wait for me");
    ts.shutdown().await;
}

#[tokio::test]
async fn test_stateless_stream_is_server_sent_events() {
    let (ts, app) = app().await;

    let (status, headers, body) = send(
        &app,
        json_request(Method::POST, "/runs/stream", run_body("sse", json!({ "steps": 1 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert!(headers.contains_key(header::CONTENT_LOCATION));

    let text = String::from_utf8(body).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty() && !frame.starts_with(':'))
        .collect();
    assert!(frames[0].starts_with("id: 1\nevent: metadata\ndata: "));
    assert!(frames[1].starts_with("id: 2\nevent: updates\n"));
    let last = frames.last().unwrap();
    assert!(last.contains("event: values"));
    let data = last.lines().find_map(|line| line.strip_prefix("data: ")).unwrap();
    let values: Value = serde_json::from_str(data).unwrap();
    assert_eq!(values["messages"][1]["content"], "echo: sse");
    ts.shutdown().await;
}

#[tokio::test]
async fn test_cancel_selector_validation() {
    let (ts, app) = app().await;

    let (status, body) = send_json(
        &app,
        json_request(
            Method::POST,
            "/runs/cancel",
            json!({ "status": "running", "thread_id": ThreadId::new().to_string() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("both"));

    let (status, _) = send_json(&app, json_request(Method::POST, "/runs/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send_json(
        &app,
        json_request(Method::POST, "/runs/cancel", json!({ "status": "all" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_ids() {
    let (ts, app) = app().await;
    let thread_id = new_thread(&app).await;

    let (status, _) = send_json(
        &app,
        empty_request(Method::GET, &format!("/threads/{thread_id}/runs/not-a-uuid")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send_json(
        &app,
        empty_request(
            Method::GET,
            &format!("/threads/{thread_id}/runs/{}", RunId::new()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_cancel_status_codes_follow_wait() {
    let (ts, app) = app().await;
    let thread_id = new_thread(&app).await;

    let mut run_ids = Vec::new();
    for _ in 0..2 {
        let (_, run) = send_json(
            &app,
            json_request(
                Method::POST,
                &format!("/threads/{thread_id}/runs"),
                run_body("hang", json!({ "hang": true })),
            ),
        )
        .await;
        run_ids.push(run["run_id"].as_str().unwrap().to_string());
    }

    let (status, _) = send_json(
        &app,
        empty_request(
            Method::POST,
            &format!("/threads/{thread_id}/runs/{}/cancel", run_ids[0]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = send_json(
        &app,
        empty_request(
            Method::POST,
            &format!(
                "/threads/{thread_id}/runs/{}/cancel?wait=true&action=rollback",
                run_ids[1]
            ),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, run) = send_json(
        &app,
        empty_request(Method::GET, &format!("/threads/{thread_id}/runs/{}", run_ids[1])),
    )
    .await;
    assert_eq!(run["status"], "interrupted");
    ts.shutdown().await;
}

#[tokio::test]
async fn test_cron_create_count_delete() {
    let (ts, app) = app().await;

    let (status, cron) = send_json(
        &app,
        json_request(
            Method::POST,
            "/runs/crons",
            json!({ "schedule": "*/5 * * * *", "assistant_id": TEST_ASSISTANT }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cron_id = cron["cron_id"].as_str().unwrap().to_string();

    let (status, count) = send_json(
        &app,
        json_request(Method::POST, "/runs/crons/count", json!({ "assistant_id": TEST_ASSISTANT })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count, json!(1));

    let (status, found) =
        send_json(&app, json_request(Method::POST, "/runs/crons/search", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found[0]["cron_id"], cron_id.as_str());

    let uri = format!("/runs/crons/{cron_id}");
    let (status, _) = send_json(&app, empty_request(Method::DELETE, &uri)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&app, empty_request(Method::DELETE, &uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &app,
        json_request(
            Method::POST,
            "/runs/crons",
            json!({ "schedule": "every minute", "assistant_id": TEST_ASSISTANT }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_batch_reports_slot_errors() {
    let (ts, app) = app().await;
    let thread_id = new_thread(&app).await;

    let (status, slots) = send_json(
        &app,
        json_request(
            Method::POST,
            "/runs/batch",
            json!([
                { "assistant_id": TEST_ASSISTANT, "input": { "message": "a" } },
                { "assistant_id": "", "input": { "message": "b" } },
                { "assistant_id": TEST_ASSISTANT, "thread_id": thread_id, "input": { "message": "c" } },
            ]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let slots = slots.as_array().unwrap();
    assert_eq!(slots.len(), 3);
    assert!(slots[0]["run_id"].is_string());
    assert_eq!(slots[1]["status"], 422);
    assert!(slots[1]["error"].is_string());
    assert_eq!(slots[2]["thread_id"], thread_id.as_str());

    let (status, _) = send_json(
        &app,
        json_request(
            Method::POST,
            "/runs/batch",
            json!([{ "assistant_id": TEST_ASSISTANT, "thread_id": "nope" }]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    ts.shutdown().await;
}
