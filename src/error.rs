//! Error types for the supervisor and JSON error responses for the relay

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used by relay response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type produced by the relay
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Failures surfaced by supervisor lifecycle operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// An executable or the base config is absent
    #[error("{what} not found at {}", path.display())]
    PrerequisiteMissing { what: &'static str, path: PathBuf },

    /// The OS refused to spawn a process
    #[error("failed to launch {role}: {message}")]
    ProcessLaunch { role: String, message: String },

    /// A process started but its port never accepted connections
    #[error("{role} did not open port {port} within {timeout_ms}ms")]
    PortTimeout { role: String, port: u16, timeout_ms: u64 },

    /// A process exited before the pair finished starting
    #[error("{role} exited during start (code {code:?})")]
    ExitedDuringStart { role: String, code: Option<i32> },

    /// Merged config or gateway config could not be produced
    #[error("config I/O failed: {0}")]
    ConfigIo(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl SupervisorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SupervisorError::Cancelled)
    }
}

/// Error codes for relay errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend, gateway or upstream could not be reached
    BadGateway,
    /// Client request body could not be read
    BodyReadFailed,
    /// Internal relay error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BodyReadFailed => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::BodyReadFailed => "BODY_READ_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap bytes into the relay's boxed body type
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}
