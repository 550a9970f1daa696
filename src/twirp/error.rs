use std::{collections::BTreeMap, fmt};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tower::BoxError;

/// Twirp error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Canceled,
    Unknown,
    InvalidArgument,
    Malformed,
    DeadlineExceeded,
    NotFound,
    BadRoute,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    Dataloss,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Canceled => "canceled",
            ErrorCode::Unknown => "unknown",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Malformed => "malformed",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BadRoute => "bad_route",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Aborted => "aborted",
            ErrorCode::OutOfRange => "out_of_range",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::Internal => "internal",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Dataloss => "dataloss",
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::Canceled | ErrorCode::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::InvalidArgument | ErrorCode::Malformed | ErrorCode::OutOfRange => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::NotFound | ErrorCode::BadRoute => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists | ErrorCode::Aborted => StatusCode::CONFLICT,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unknown | ErrorCode::Internal | ErrorCode::Dataloss => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Code for a non-twirp error response, e.g. from a proxy in between.
    pub fn from_intermediary_status(status: StatusCode) -> Self {
        match status.as_u16() {
            300..=400 => ErrorCode::Internal,
            401 => ErrorCode::Unauthenticated,
            403 => ErrorCode::PermissionDenied,
            404 => ErrorCode::BadRoute,
            429 | 502 | 503 | 504 => ErrorCode::Unavailable,
            _ => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed RPC failure, serialized as the JSON error body of a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("twirp error {code}: {msg}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub msg: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn invalid_argument(argument: &str, validation_msg: &str) -> Self {
        Self::new(
            ErrorCode::InvalidArgument,
            format!("{argument} {validation_msg}"),
        )
        .with_meta("argument", argument)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn bad_route(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRoute, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Malformed, msg)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn to_json(&self) -> Vec<u8> {
        // a struct of strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes an error response body, falling back to an intermediary error
    /// when the body is not a twirp error.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<RpcError>(body) {
            Ok(err) => err,
            Err(_) => Self::new(
                ErrorCode::from_intermediary_status(status),
                format!("Error from intermediary with HTTP status code {status}"),
            )
            .with_meta("http_error_from_intermediary", "true")
            .with_meta("status_code", status.as_str())
            .with_meta("body", String::from_utf8_lossy(body)),
        }
    }
}

/// Failure of a client call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("transport failed: {0}")]
    Transport(#[source] BoxError),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ClientError {
    pub fn as_rpc(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_carries_argument_meta() {
        let err = RpcError::invalid_argument("inches", "I can't make a hat that small!");

        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert_eq!(err.msg, "inches I can't make a hat that small!");
        assert_eq!(err.meta("argument"), Some("inches"));
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_body_uses_snake_case_codes() {
        let err = RpcError::bad_route("no handler");
        let body: serde_json::Value = serde_json::from_slice(&err.to_json()).unwrap();

        assert_eq!(body["code"], "bad_route");
        assert_eq!(body["msg"], "no handler");
        assert!(body.get("meta").is_none());
    }

    #[test]
    fn twirp_error_body_is_decoded() {
        let err = RpcError::internal("boom").with_meta("retryable", "true");

        let decoded = RpcError::from_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_json());

        assert_eq!(decoded, err);
    }

    #[test]
    fn foreign_body_becomes_intermediary_error() {
        let err = RpcError::from_response(StatusCode::BAD_GATEWAY, b"<html>bad gateway</html>");

        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(err.meta("http_error_from_intermediary"), Some("true"));
        assert_eq!(err.meta("status_code"), Some("502"));
    }
}
