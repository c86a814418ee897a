//! The full router driven request by request.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use sandgrid_api::{AllowAll, build_router};
use sandgrid_state::StateStore;
use serde_json::Value;
use tower::ServiceExt;

fn router() -> Router {
    build_router(StateStore::open_in_memory().unwrap(), Arc::new(AllowAll))
}

async fn call(router: &Router, method: &str, uri: &str, token: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(body)
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn call_json(router: &Router, method: &str, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
    let (status, bytes) = call(router, method, uri, token, Body::from(body.to_string())).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn task_lifecycle_over_http() {
    let router = router();

    let (status, upload) = call(&router, "POST", "/blob/", "client", Body::from("input data")).await;
    assert_eq!(status, StatusCode::CREATED);
    let upload: Value = serde_json::from_slice(&upload).unwrap();
    assert_eq!(upload["status"], "OK");
    let reference = upload["reference"].as_str().unwrap().to_string();

    let task = serde_json::json!({
        "image": "alpine",
        "args": ["cat", "input"],
        "limits": { "cpus": 1, "memory": "256m" },
        "files": { "input": { "reference": reference } },
        "collect": [{ "glob": "*.txt" }],
    });
    let (status, submitted) = call_json(&router, "POST", "/task/", "client", task).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = submitted["id"].as_str().unwrap().to_string();

    let (status, fetched) = call_json(&router, "GET", &format!("/task/{id}/"), "client", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["image"], "alpine");

    let (status, batch) = call_json(
        &router,
        "POST",
        "/queue/dequeue/",
        "node-a",
        serde_json::json!({ "concurrency": 4, "limits": { "cpus": 4, "memory": "1g" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tasks = batch["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], id.as_str());
    assert_eq!(tasks[0]["limits"]["cpus_offset"], 0);

    let (_, stats) = call_json(&router, "GET", "/queue/stats/", "client", Value::Null).await;
    assert_eq!(stats["assigned"], 1);
    assert_eq!(stats["assignees"]["node-a"], 1);

    let result = serde_json::json!({ "result": 0 });
    let (status, _) = call_json(&router, "POST", &format!("/result/{id}/"), "node-a", result).await;
    assert_eq!(status, StatusCode::OK);

    let (status, stored) = call_json(&router, "GET", &format!("/result/{id}/"), "client", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["result"], 0);

    let (status, bytes) = call(&router, "GET", &format!("/blob/{reference}/"), "client", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"input data");

    let (status, _) = call_json(&router, "DELETE", &format!("/task/{id}/"), "client", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call_json(&router, "GET", &format!("/result/{id}/"), "client", Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "FAIL");
}

#[tokio::test]
async fn task_with_local_file_is_rejected() {
    let router = router();
    let task = serde_json::json!({ "files": { "input": { "path": "input.txt" } } });
    let (status, body) = call_json(&router, "POST", "/task/", "client", task).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "FAIL");
}

#[tokio::test]
async fn exclusive_task_runs_alone() {
    let router = router();
    for exclusive in [false, true, false] {
        let task = serde_json::json!({ "exclusive": exclusive, "limits": { "cpus": 1 } });
        let (status, _) = call_json(&router, "POST", "/task/", "client", task).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let capacity = serde_json::json!({ "concurrency": 8, "limits": { "cpus": 8 } });
    let (_, first) = call_json(&router, "POST", "/queue/dequeue/", "n", capacity.clone()).await;
    assert_eq!(first["tasks"].as_array().unwrap().len(), 1);
    let (_, second) = call_json(&router, "POST", "/queue/dequeue/", "n", capacity.clone()).await;
    let second = second["tasks"].as_array().unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["exclusive"], true);
    let (_, third) = call_json(&router, "POST", "/queue/dequeue/", "n", capacity).await;
    assert_eq!(third["tasks"].as_array().unwrap().len(), 1);
}
