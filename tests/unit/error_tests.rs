//! Unit tests for the error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use sandpool::api::http::status_for;
use sandpool::{AppError, ErrorKind};

#[test]
fn display_prefixes_kind() {
    assert_eq!(
        AppError::NotFound("session abc".into()).to_string(),
        "not found: session abc"
    );
    assert_eq!(
        AppError::WorkerCrash("gone".into()).to_string(),
        "worker crash: gone"
    );
    assert_eq!(
        AppError::PathTraversal("../x".into()).to_string(),
        "path traversal: ../x"
    );
}

#[test]
fn infrastructure_variants_classify_as_internal() {
    for err in [
        AppError::Config("c".into()),
        AppError::Io("i".into()),
        AppError::Protocol("p".into()),
        AppError::Internal("x".into()),
    ] {
        assert_eq!(err.kind(), ErrorKind::Internal, "{err}");
    }
}

/// Kind and message survive the trip through the wire representation.
#[test]
fn from_kind_rebuilds_taxonomy() {
    let original = AppError::Validation("bad name".into());
    let rebuilt = AppError::from_kind(original.kind(), original.message().to_owned());
    assert_eq!(rebuilt, original);
}

#[test]
fn error_kind_serializes_snake_case() {
    let json = serde_json::to_string(&ErrorKind::PathTraversal).expect("serialize");
    assert_eq!(json, "\"path_traversal\"");
    let kind: ErrorKind = serde_json::from_str("\"worker_crash\"").expect("deserialize");
    assert_eq!(kind, ErrorKind::WorkerCrash);
}

#[test]
fn io_error_converts() {
    let err: AppError = std::io::Error::other("disk").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("disk")));
}

#[test]
fn status_mapping_follows_kind() {
    assert_eq!(status_for(&AppError::NotFound(String::new())), StatusCode::NOT_FOUND);
    assert_eq!(status_for(&AppError::Validation(String::new())), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(&AppError::PathTraversal(String::new())), StatusCode::FORBIDDEN);
    assert_eq!(status_for(&AppError::Timeout(String::new())), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        status_for(&AppError::WorkerCrash(String::new())),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        status_for(&AppError::Protocol(String::new())),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
