use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;

use stockledger_infra::{AdjustError, LedgerError};

/// Seconds a client should wait before retrying a contended key.
const BUSY_RETRY_AFTER_SECS: &str = "1";

pub fn adjust_error_to_response(err: AdjustError) -> axum::response::Response {
    match err {
        AdjustError::Busy => {
            let mut res = json_error(StatusCode::SERVICE_UNAVAILABLE, "busy", err.to_string());
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(BUSY_RETRY_AFTER_SECS));
            res
        }
        AdjustError::InsufficientStock { available, requested } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "insufficient_stock",
                "message": err.to_string(),
                "available": available,
                "requested": requested,
            })),
        )
            .into_response(),
        AdjustError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        AdjustError::Backend(msg) => {
            tracing::error!(error = %msg, "adjustment backend failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "backend_error", msg)
        }
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    tracing::error!(error = %err, "ledger query failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "backend_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
