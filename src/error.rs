//! Error handling for Doorkeeper
//!
//! Addressing errors (an OID written outside its namespace, a duplicate
//! instance OID) are not represented here: they are programming errors and
//! panic inside the catalog.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::device_gateway::DeviceError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (shadow copy discarded, live state unchanged)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unauthorized
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Device communication error
    #[error("Device {device_id}: {source}")]
    Device {
        device_id: u32,
        #[source]
        source: DeviceError,
    },

    /// Rule evaluation error for a single card
    #[error("Rule evaluation failed for card {card}: {message}")]
    Rules { card: String, message: String },

    /// TaskQ is full
    #[error("Task queue full: {0}")]
    QueueFull(String),

    /// Request deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps a device failure with the device it happened on
    pub fn device(device_id: u32, source: DeviceError) -> Self {
        Error::Device { device_id, source }
    }

    /// True for errors caused by talking to a device
    pub fn is_device(&self) -> bool {
        matches!(self, Error::Device { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            Error::Device { .. } => (StatusCode::BAD_GATEWAY, "DEVICE_ERROR", self.to_string()),
            Error::Rules { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "RULES_ERROR",
                self.to_string(),
            ),
            Error::QueueFull(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_FULL",
                msg.clone(),
            ),
            Error::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg.clone()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                e.to_string(),
            ),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
