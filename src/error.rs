//! Error types for orcvm.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-stable error taxonomy, per the error handling design.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    InvalidState,
    NotFound,
    TransportUnavailable,
    BackendFailure,
    TimeoutExceeded,
    PayloadInvalid,
    PermissionDenied,
    ResourceExhausted,
    InternalError,
}

/// Structured, user-visible error envelope: `{"code":"NOT_FOUND","message":"...","retryable":false}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"code":"INTERNAL_ERROR","message":"serialization failed","retryable":true}"#
                .to_string()
        })
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidState(m) => ApiError::new(ApiErrorCode::InvalidState, m.clone(), false),
            Error::NotFound(m) => ApiError::new(ApiErrorCode::NotFound, m.clone(), false),
            Error::TransportUnavailable(m) => {
                ApiError::new(ApiErrorCode::TransportUnavailable, m.clone(), true)
            }
            Error::BackendFailure(m) => ApiError::new(ApiErrorCode::BackendFailure, m.clone(), true),
            Error::TimeoutExceeded(m) => {
                ApiError::new(ApiErrorCode::TimeoutExceeded, m.clone(), true)
            }
            Error::PayloadInvalid(m) => ApiError::new(ApiErrorCode::PayloadInvalid, m.clone(), false),
            Error::PermissionDenied(m) => {
                ApiError::new(ApiErrorCode::PermissionDenied, m.clone(), false)
            }
            Error::ResourceExhausted(m) => {
                ApiError::new(ApiErrorCode::ResourceExhausted, m.clone(), true)
            }
            other => ApiError::new(ApiErrorCode::InternalError, other.to_string(), true),
        }
    }
}

/// Errors that can occur in orcvm operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not valid for the entity's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unknown VM/task/worker/execution id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Vsock and TCP transports both failed within the deadline.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Hypervisor/runtime process exited unexpectedly or a control call failed.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// Caller deadline was hit.
    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),

    /// Task payload failed to decode or validate.
    #[error("payload invalid: {0}")]
    PayloadInvalid(String),

    /// Host lacks required access (KVM, socket permissions, ...).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Worker is at capacity or disk space is below threshold.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler stopped early because its task was cancelled at shutdown.
    #[error("task cancelled")]
    Cancelled,

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// System call errors (Linux only, nix crate).
    #[cfg(target_os = "linux")]
    #[error("system error: {0}")]
    System(#[from] nix::Error),

    /// Protocol wire-format errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] orcvm_protocol::ProtocolError),

    /// OCI image/runtime errors from the container backend.
    #[error("oci error: {0}")]
    Oci(#[from] orcvm_oci::OciError),
}
