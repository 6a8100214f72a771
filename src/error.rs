//! Crate-wide error taxonomy for the HTTP/WebSocket boundary.
//!
//! Interior code (config I/O, PTY spawn, task bodies) propagates with
//! `anyhow::Result`; handlers convert into one of these variants at the
//! boundary, matching the split already drawn between free-form `anyhow`
//! use and the typed `ValidationError` enum elsewhere in this codebase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("token too weak: must be at least 8 characters")]
    WeakToken,
    #[error("already exists")]
    AlreadyExists,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("failed to spawn: {0}")]
    SpawnFailed(String),
    #[error("internal error: {0}")]
    Fatal(String),
}

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The `{success, data?, error?}` envelope every HTTP response is wrapped in.
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::WeakToken => StatusCode::BAD_REQUEST,
            AppError::AlreadyExists => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_codes_match_section_seven() {
        let cases = [
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
            (AppError::WeakToken, StatusCode::BAD_REQUEST),
            (AppError::AlreadyExists, StatusCode::CONFLICT),
            (AppError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::SpawnFailed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::Fatal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn error_body_carries_envelope_with_message() {
        let response = AppError::NotFound.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "not found");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn ok_envelope_wraps_data_with_success_true() {
        let response = ok(serde_json::json!({"hasToken": true}));
        assert_eq!(response.0["success"], true);
        assert_eq!(response.0["data"]["hasToken"], true);
    }
}
