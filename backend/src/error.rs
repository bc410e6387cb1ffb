// =============================================================================
// FIELDLINK — Request outcomes and collaborator errors
// =============================================================================
// Every rejected request ends up as a `Reject`, which knows its HTTP status and
// the machine-readable reason code devices key their retry policy on.
// =============================================================================

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// One structural problem found in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum Reject {
    #[error("malformed request body ({} problems)", .0.len())]
    BadBody(Vec<FieldError>),
    #[error("timestamp, nonce or signature header missing")]
    MissingSignatureHeaders,
    #[error("unsupported signature algorithm")]
    UnsupportedAlg,
    #[error("timestamp header is not a number")]
    BadTimestamp,
    #[error("timestamp outside allowed clock skew")]
    TimestampSkew,
    #[error("nonce already used")]
    ReplayNonce,
    #[error("signature mismatch")]
    BadSignature,
    #[error("device not registered")]
    DeviceNotRegistered,
    #[error("device secret header required to verify unregistered device")]
    MissingDeviceSecretForSignature,
    #[error("X-Device-Id does not match envelope deviceId")]
    DeviceIdMismatch,
    #[error("device registry unavailable")]
    DbUnavailable,
    #[error("telemetry insert failed after {ingested} items")]
    TelemetryInsertFailed { ingested: usize },
    #[error("fallback file append failed")]
    FallbackWriteFailed,
}

impl Reject {
    pub fn code(&self) -> &'static str {
        match self {
            Reject::BadBody(_) => "bad_body",
            Reject::MissingSignatureHeaders => "missing_signature_headers",
            Reject::UnsupportedAlg => "unsupported_alg",
            Reject::BadTimestamp => "bad_timestamp",
            Reject::TimestampSkew => "timestamp_skew",
            Reject::ReplayNonce => "replay_nonce",
            Reject::BadSignature => "bad_signature",
            Reject::DeviceNotRegistered => "device_not_registered",
            Reject::MissingDeviceSecretForSignature => "missing_device_secret_for_signature",
            Reject::DeviceIdMismatch => "device_id_mismatch",
            Reject::DbUnavailable => "db_unavailable",
            Reject::TelemetryInsertFailed { .. } => "telemetry_insert_failed",
            Reject::FallbackWriteFailed => "fallback_write_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Reject::BadBody(_) => StatusCode::BAD_REQUEST,
            Reject::DbUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Reject::TelemetryInsertFailed { .. } | Reject::FallbackWriteFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Authentication outcomes (always 401) that security monitoring cares about.
    pub fn is_auth(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }

    fn details(&self) -> Option<Value> {
        match self {
            Reject::BadBody(errors) => Some(json!(errors)),
            Reject::TelemetryInsertFailed { ingested } => Some(json!({ "ingested": ingested })),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct RejectBody {
    ok: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for Reject {
    fn into_response(self) -> Response {
        let body = RejectBody { ok: false, error: self.code(), details: self.details() };
        (self.status(), Json(body)).into_response()
    }
}

/// Failures reported by the device registry and reading store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique key already present. Callers decide whether that is success.
    #[error("duplicate key")]
    Duplicate,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Value the store cannot represent.
    #[error("invalid value: {0}")]
    Invalid(String),
}
