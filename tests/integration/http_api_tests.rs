//! HTTP surface over a live pool.
//!
//! Binds an ephemeral listener and drives the routes with `reqwest`.

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sandpool::api::http::{router, serve_listener};

use super::test_helpers::{start_pool, TestPool};

const BOUNDARY: &str = "sandpool-test-boundary";

async fn spawn_server(harness: &TestPool) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let cancel = CancellationToken::new();
    let app = router(harness.pool.clone(), harness.config.max_upload_bytes);
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = serve_listener(listener, app, server_cancel).await;
    });
    (format!("http://{addr}"), cancel)
}

fn multipart_body(filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn create(client: &reqwest::Client, base: &str) -> String {
    let resp = client
        .post(format!("{base}/sessions"))
        .send()
        .await
        .expect("POST /sessions");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    body["sessionId"].as_str().expect("session id").to_owned()
}

async fn upload(client: &reqwest::Client, base: &str, id: &str, name: &str) -> reqwest::Response {
    client
        .post(format!("{base}/sessions/{id}/files"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart_body(name, b"hello over http"))
        .send()
        .await
        .expect("POST files")
}

#[tokio::test]
async fn health_and_slots() {
    let harness = start_pool(2, 10).await;
    let (base, cancel) = spawn_server(&harness).await;

    let resp = reqwest::get(format!("{base}/health")).await.expect("health");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");

    let slots: Value = reqwest::get(format!("{base}/slots"))
        .await
        .expect("slots")
        .json()
        .await
        .expect("json");
    let slots = slots.as_array().expect("array");
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["status"], "ready");

    cancel.cancel();
    harness.shutdown().await;
}

#[tokio::test]
async fn session_flow_over_http() {
    let harness = start_pool(2, 10).await;
    let (base, cancel) = spawn_server(&harness).await;
    let client = reqwest::Client::new();

    let id = create(&client, &base).await;

    let resp = upload(&client, &base, &id, "greeting.txt").await;
    assert_eq!(resp.status(), 200);
    let stored: Value = resp.json().await.expect("json");
    assert_eq!(stored["filename"], "greeting.txt");

    let resp = client
        .post(format!("{base}/sessions/{id}/execute"))
        .json(&json!({ "code": r#"let text = read_file("greeting.txt"); print(text); text.len()"# }))
        .send()
        .await
        .expect("execute");
    assert_eq!(resp.status(), 200);
    let output: Value = resp.json().await.expect("json");
    assert_eq!(output["result"], json!(15));
    assert_eq!(output["stdout"], "hello over http\n");
    assert!(output["error"].is_null());

    let resp = client
        .get(format!("{base}/sessions/{id}/files?path=greeting.txt"))
        .send()
        .await
        .expect("download");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.bytes().await.expect("bytes").as_ref(),
        b"hello over http"
    );

    cancel.cancel();
    harness.shutdown().await;
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let harness = start_pool(1, 10).await;
    let (base, cancel) = spawn_server(&harness).await;
    let client = reqwest::Client::new();
    let id = create(&client, &base).await;

    let resp = client
        .post(format!("{base}/sessions/unknown/execute"))
        .json(&json!({ "code": "1" }))
        .send()
        .await
        .expect("execute");
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["kind"], "not_found");

    let resp = upload(&client, &base, &id, "..").await;
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{base}/sessions/{id}/files?path=../../etc/passwd"))
        .send()
        .await
        .expect("download");
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["kind"], "path_traversal");

    let resp = client
        .post(format!("{base}/sessions/{id}/execute"))
        .json(&json!({ "code": "loop { }", "timeoutMs": 200 }))
        .send()
        .await
        .expect("execute");
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["kind"], "timeout");

    cancel.cancel();
    harness.shutdown().await;
}
