//! Unit tests for the NDJSON codec, the reader task and message shapes.

use bytes::BytesMut;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use sandpool::errors::ErrorKind;
use sandpool::models::worker::WorkerIdentity;
use sandpool::protocol::codec::WireCodec;
use sandpool::protocol::reader::{parse_line, run_reader, ReaderExit};
use sandpool::protocol::{SuccessPayload, WorkerRequest, WorkerResponse};
use sandpool::AppError;

// ── Codec ────────────────────────────────────────────────────────────────────

#[test]
fn partial_line_waits_for_newline() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"ready\"");
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b",\"identity\":\"w\"}\n");
    let line = codec.decode(&mut buf).expect("decode").expect("line");
    assert_eq!(line, "{\"type\":\"ready\",\"identity\":\"w\"}");
}

#[test]
fn overlong_line_is_protocol_error() {
    let mut codec = WireCodec::with_max_length(16);
    let mut buf = BytesMut::from("0123456789abcdefXYZ\n");
    let err = codec.decode(&mut buf).expect_err("too long");
    assert!(matches!(err, AppError::Protocol(ref msg) if msg.contains("line too long")));
}

// ── Message shapes ───────────────────────────────────────────────────────────

#[test]
fn upload_content_travels_as_base64() {
    let request = WorkerRequest::UploadFile {
        task_id: "t1".into(),
        session_id: "s1".into(),
        filename: "a.bin".into(),
        content: vec![0, 255, 16],
    };
    let value = serde_json::to_value(&request).expect("serialize");
    assert_eq!(
        value,
        json!({
            "type": "upload_file",
            "task_id": "t1",
            "session_id": "s1",
            "filename": "a.bin",
            "content": "AP8Q"
        })
    );
}

#[test]
fn success_payload_is_tagged_by_kind() {
    let line = r#"{"type":"success","task_id":"t9","payload":{"kind":"executed","result":2,"stdout":"","error":null}}"#;
    let parsed: WorkerResponse = parse_line(line).expect("parse").expect("message");
    assert_eq!(
        parsed,
        WorkerResponse::Success {
            task_id: "t9".into(),
            payload: SuccessPayload::Executed {
                result: json!(2),
                stdout: String::new(),
                error: None,
            },
        }
    );
}

#[test]
fn error_kind_is_optional_on_the_wire() {
    let line = r#"{"type":"error","task_id":"t2","message":"Session not found"}"#;
    let parsed: WorkerResponse = parse_line(line).expect("parse").expect("message");
    assert_eq!(
        parsed,
        WorkerResponse::Error {
            task_id: "t2".into(),
            kind: None,
            message: "Session not found".into(),
        }
    );

    let with_kind = WorkerResponse::Error {
        task_id: "t3".into(),
        kind: Some(ErrorKind::PathTraversal),
        message: "x".into(),
    };
    let value = serde_json::to_value(&with_kind).expect("serialize");
    assert_eq!(value["kind"], json!("path_traversal"));
}

#[test]
fn blank_lines_parse_to_nothing() {
    let parsed: Option<WorkerResponse> = parse_line("   ").expect("blank ok");
    assert!(parsed.is_none());
}

#[test]
fn malformed_lines_are_protocol_errors() {
    let err = parse_line::<WorkerResponse>("{not json").expect_err("malformed");
    assert!(matches!(err, AppError::Protocol(_)));
}

// ── Reader task ──────────────────────────────────────────────────────────────

/// Garbage between valid lines is skipped; EOF ends the reader.
#[tokio::test]
async fn reader_skips_garbage_and_reports_eof() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::channel::<WorkerResponse>(8);
    let task = tokio::spawn(run_reader(
        "test".into(),
        server,
        tx,
        |message| message,
        CancellationToken::new(),
    ));

    client
        .write_all(b"{\"type\":\"ready\",\"identity\":\"w1\"}\nnot json\n\n{\"type\":\"error\",\"task_id\":\"t\",\"message\":\"m\"}\n")
        .await
        .expect("write");
    drop(client);

    let first = rx.recv().await.expect("first");
    assert_eq!(
        first,
        WorkerResponse::Ready {
            identity: WorkerIdentity::from("w1".to_owned())
        }
    );
    let second = rx.recv().await.expect("second");
    assert!(matches!(second, WorkerResponse::Error { ref task_id, .. } if task_id == "t"));

    assert_eq!(task.await.expect("join"), ReaderExit::Eof);
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (_client, server) = tokio::io::duplex(64);
    let (tx, _rx) = mpsc::channel::<WorkerResponse>(1);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_reader("test".into(), server, tx, |m| m, cancel.clone()));

    cancel.cancel();
    assert_eq!(task.await.expect("join"), ReaderExit::Cancelled);
}
