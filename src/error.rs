//! Error types for swill.

use thiserror::Error;

use crate::protocol::ErrorMessage;

/// Main error type for all swill operations.
#[derive(Debug, Error)]
pub enum SwillError {
    /// I/O error during socket operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The WebSocket handshake was rejected (bad subprotocol, hook abort).
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A value could not be serialized to MessagePack.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame or payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Protocol violation (bad envelope shape, out-of-order frame, etc).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An error response, either raised by a handler or received from the
    /// peer.
    #[error("rpc error {}: {}", .0.code, .0.message)]
    Rpc(ErrorMessage),

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connect attempt did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// All reconnection attempts were exhausted.
    #[error("reconnection failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of reconnection attempts made.
        attempts: u32,
    },

    /// Invalid registration or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Raised from a lifecycle hook to close the WebSocket connection with a
    /// status code. Codes below 1000 are coerced to 1000 once the handshake
    /// has completed.
    #[error("closing connection: {reason} ({code})")]
    CloseConnection {
        /// WebSocket close code (RFC 6455).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

impl SwillError {
    /// Shortcut for building an [`SwillError::Rpc`] with a code and message.
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        SwillError::Rpc(ErrorMessage::new(code, message))
    }

    pub(crate) fn encode_err(e: impl std::fmt::Display) -> Self {
        SwillError::Encode(e.to_string())
    }

    pub(crate) fn decode_err(e: impl std::fmt::Display) -> Self {
        SwillError::Decode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SwillError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SwillError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SwillError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SwillError::Decode(e.to_string())
    }
}

/// Result type alias using SwillError.
pub type Result<T> = std::result::Result<T, SwillError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;

    #[test]
    fn test_rpc_shortcut() {
        let err = SwillError::rpc(ErrorCode::MethodNotFound.code(), "no such method");
        match err {
            SwillError::Rpc(ref message) => {
                assert_eq!(message.code, 404);
                assert_eq!(message.message, "no such method");
                assert!(message.data.is_none());
            }
            _ => panic!("expected Rpc variant"),
        }
        assert_eq!(err.to_string(), "rpc error 404: no such method");
    }

    #[test]
    fn test_close_connection_display() {
        let err = SwillError::CloseConnection {
            code: 1008,
            reason: "policy violation".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "closing connection: policy violation (1008)"
        );
    }
}
