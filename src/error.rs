//! Error taxonomy shared by the gate, the dispatcher and the backend client.
//!
//! Every terminal failure a request can reach is one of these variants. They
//! are plain values (cloneable, comparable) so one outcome can be handed to
//! every follower of an in-flight call.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// A prompt or message exceeds the configured length ceiling.
    #[error("{field} is {length} characters, limit is {limit}")]
    PayloadTooLarge {
        field: String,
        length: usize,
        limit: usize,
    },

    /// Content policy rejected the payload.
    #[error("sanitization failed: {reason}")]
    SanitizationFailed { reason: String },

    /// Missing or wrong token, or a disallowed origin.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Unknown tool or arguments that do not decode.
    #[error("invalid request: {details}")]
    InvalidRequest { details: String },

    /// Every execution slot is busy and the wait queue is at capacity.
    #[error("request queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    /// The caller's deadline passed while the request was still queued.
    #[error("deadline exceeded after waiting {waited_ms}ms for an execution slot")]
    DeadlineExceeded { waited_ms: u64 },

    /// Transient failures persisted through every retry.
    #[error("backend unavailable after {attempts} attempts: {last_error}")]
    BackendUnavailable { attempts: u32, last_error: String },

    /// The backend refused the request (4xx). Not retried.
    #[error("backend rejected request with HTTP {status}: {body}")]
    BackendRejected { status: u16, body: String },

    /// The backend answered, but not in a shape we understand.
    #[error("malformed backend response: {details}")]
    MalformedBackendResponse { details: String },

    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Short stable label, used for audit reasons and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::SanitizationFailed { .. } => "sanitization_failed",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::QueueFull { .. } => "queue_full",
            GatewayError::DeadlineExceeded { .. } => "deadline_exceeded",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::BackendRejected { .. } => "backend_rejected",
            GatewayError::MalformedBackendResponse { .. } => "malformed_backend_response",
            GatewayError::Cancelled => "cancelled",
        }
    }

    /// True for rejections made before the backend was ever involved.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::PayloadTooLarge { .. }
                | GatewayError::SanitizationFailed { .. }
                | GatewayError::Unauthorized { .. }
                | GatewayError::InvalidRequest { .. }
                | GatewayError::QueueFull { .. }
                | GatewayError::DeadlineExceeded { .. }
        )
    }

    /// JSON-RPC error code used when the failure is reported as a protocol
    /// error rather than as a tool result.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            GatewayError::Unauthorized { .. } => -32001,
            GatewayError::InvalidRequest { .. } => -32602,
            GatewayError::PayloadTooLarge { .. } => -32003,
            GatewayError::SanitizationFailed { .. } => -32004,
            GatewayError::QueueFull { .. } => -32005,
            GatewayError::DeadlineExceeded { .. } => -32006,
            GatewayError::Cancelled => -32800,
            GatewayError::BackendUnavailable { .. }
            | GatewayError::BackendRejected { .. }
            | GatewayError::MalformedBackendResponse { .. } => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_and_backpressure_failures_are_rejections() {
        let too_large = GatewayError::PayloadTooLarge {
            field: "prompt".into(),
            length: 9000,
            limit: 8192,
        };
        assert!(too_large.is_rejection());
        assert!(GatewayError::QueueFull { capacity: 4 }.is_rejection());

        let unavailable = GatewayError::BackendUnavailable {
            attempts: 4,
            last_error: "connection refused".into(),
        };
        assert!(!unavailable.is_rejection());
        assert_eq!(unavailable.kind(), "backend_unavailable");
    }

    #[test]
    fn display_carries_details() {
        let err = GatewayError::PayloadTooLarge {
            field: "prompt".into(),
            length: 9000,
            limit: 8192,
        };
        assert_eq!(err.to_string(), "prompt is 9000 characters, limit is 8192");
        assert_eq!(err.jsonrpc_code(), -32003);
    }
}
