//! Cross-cutting error types for autograsper operations.
//!
//! Defines the error types shared by more than one subsystem:
//! - Robot transport failures (HTTP, decoding, simulated faults)
//! - Append-only storage of episode logs
//!
//! Subsystem-specific errors live next to the code that raises them.

use thiserror::Error;

/// Errors returned by a robot transport call.
///
/// Every transport call may fail; callers are expected to tolerate these
/// without crashing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Robot API returned status {code}: {message}")]
    ApiError { code: u16, message: String },

    #[error("Malformed response from robot API: {0}")]
    MalformedResponse(String),

    #[error("Failed to decode camera image: {0}")]
    ImageDecode(String),

    #[error("Unknown robot '{0}'")]
    UnknownRobot(String),

    #[error("Simulated transport failure: {0}")]
    Simulated(String),
}

/// Errors that can occur while persisting episode logs.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Log file '{path}' does not contain a JSON array")]
    NotAnArray { path: String },

    #[error("Failed to persist '{path}': {reason}")]
    PersistFailed { path: String, reason: String },

    #[error("Status file '{0}' already written")]
    StatusAlreadyWritten(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ApiError {
            code: 503,
            message: "busy".to_string(),
        };
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("busy"));

        let err = TransportError::UnknownRobot("robot99".to_string());
        assert!(err.to_string().contains("robot99"));
    }

    #[test]
    fn test_storage_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }
}
