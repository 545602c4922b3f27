//! Typed envelope model.
//!
//! Frames on the wire are MessagePack arrays; this module is the typed
//! boundary between those untyped arrays and handler contracts.
//!
//! Request envelope slots: `[seq, data, method, type?, metadata?]`.
//! Response envelope slots: `[seq, data, type?, leading_metadata?, trailing_metadata?]`.
//!
//! Trailing optional slots are omitted when at their defaults; the codec in
//! [`crate::codec`] enforces the minimal-tail rule.

use std::collections::BTreeMap;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Key/value metadata attached to frames.
///
/// Maps are unordered on the wire; duplicate keys collapse last-write-wins
/// when decoded.
pub type Metadata = BTreeMap<String, Value>;

/// Frame types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    /// A standard message that may also carry metadata.
    Message = 0,
    /// No more messages will be sent for this sequence.
    EndOfStream = 1,
    /// Standalone leading metadata, sent before the first message of a
    /// streaming request.
    Metadata = 2,
    /// Terminate the request. No further frames are exchanged.
    Cancel = 3,
}

impl RequestKind {
    /// Decode a wire discriminant.
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(RequestKind::Message),
            1 => Some(RequestKind::EndOfStream),
            2 => Some(RequestKind::Metadata),
            3 => Some(RequestKind::Cancel),
            _ => None,
        }
    }

    /// Wire discriminant for this kind.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Frame types a server may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseKind {
    /// A standard message that may also carry metadata.
    Message = 0,
    /// No more messages will be sent for this sequence. May carry trailing
    /// metadata.
    EndOfStream = 1,
    /// Standalone leading metadata, sent before the first message of a
    /// streaming response.
    Metadata = 2,
    /// An error payload. Implies end-of-stream for streaming responses.
    Error = 3,
}

impl ResponseKind {
    /// Decode a wire discriminant.
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(ResponseKind::Message),
            1 => Some(ResponseKind::EndOfStream),
            2 => Some(ResponseKind::Metadata),
            3 => Some(ResponseKind::Error),
            _ => None,
        }
    }

    /// Wire discriminant for this kind.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Reserved error codes, numbered after the HTTP scheme the protocol's
/// reference deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request violated the protocol or carried a malformed payload.
    InvalidArgument,
    /// The caller is not authenticated.
    Unauthenticated,
    /// The caller is authenticated but not allowed.
    PermissionDenied,
    /// No handler is registered for the requested method.
    MethodNotFound,
    /// The request was cancelled.
    Cancelled,
    /// The handler failed unexpectedly.
    InternalError,
    /// The service is temporarily unavailable.
    Unavailable,
    /// The request deadline passed before a response was produced.
    DeadlineExceeded,
}

impl ErrorCode {
    /// Numeric wire code.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::MethodNotFound => 404,
            ErrorCode::Cancelled => 499,
            ErrorCode::InternalError => 500,
            ErrorCode::Unavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
        }
    }
}

/// Error payload carried in the `data` slot of an ERROR response.
///
/// Encoded as a MessagePack map; `data` is omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Numeric error code (see [`ErrorCode`] for reserved values).
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail supplied by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorMessage {
    /// Create an error payload without detail data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an error payload for a reserved code.
    pub fn reserved(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.code(), message)
    }

    /// Attach structured detail data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A decoded request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Per-connection sequence number. 0 is reserved.
    pub seq: u64,
    /// Payload. Nil for control frames.
    pub data: Value,
    /// Name of the procedure being called.
    pub method: String,
    /// Frame type. Defaults to MESSAGE when absent on the wire.
    pub kind: RequestKind,
    /// Leading metadata. For streaming requests it may only be sent once,
    /// with the opening exchange.
    pub metadata: Option<Metadata>,
}

impl RequestFrame {
    /// A MESSAGE frame carrying `data`.
    pub fn message(seq: u64, method: impl Into<String>, data: Value) -> Self {
        Self {
            seq,
            data,
            method: method.into(),
            kind: RequestKind::Message,
            metadata: None,
        }
    }

    /// An END_OF_STREAM control frame.
    pub fn end_of_stream(seq: u64, method: impl Into<String>) -> Self {
        Self {
            seq,
            data: Value::Nil,
            method: method.into(),
            kind: RequestKind::EndOfStream,
            metadata: None,
        }
    }

    /// A standalone METADATA control frame.
    pub fn metadata(seq: u64, method: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            seq,
            data: Value::Nil,
            method: method.into(),
            kind: RequestKind::Metadata,
            metadata: Some(metadata),
        }
    }

    /// A CANCEL control frame.
    pub fn cancel(seq: u64, method: impl Into<String>) -> Self {
        Self {
            seq,
            data: Value::Nil,
            method: method.into(),
            kind: RequestKind::Cancel,
            metadata: None,
        }
    }

    /// Attach metadata to this frame.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A decoded response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Sequence number of the request this frame answers.
    pub seq: u64,
    /// Payload. Nil for control frames; an [`ErrorMessage`] map for ERROR.
    pub data: Value,
    /// Frame type. Defaults to MESSAGE when absent on the wire.
    pub kind: ResponseKind,
    /// Leading metadata; sent at most once, on or before the first message.
    pub leading_metadata: Option<Metadata>,
    /// Trailing metadata; only valid on the terminal frame.
    pub trailing_metadata: Option<Metadata>,
}

impl ResponseFrame {
    /// A MESSAGE frame carrying `data`.
    pub fn message(seq: u64, data: Value) -> Self {
        Self {
            seq,
            data,
            kind: ResponseKind::Message,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }

    /// An END_OF_STREAM control frame.
    pub fn end_of_stream(seq: u64) -> Self {
        Self {
            seq,
            data: Value::Nil,
            kind: ResponseKind::EndOfStream,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }

    /// A standalone METADATA frame carrying leading metadata.
    pub fn metadata(seq: u64, metadata: Metadata) -> Self {
        Self {
            seq,
            data: Value::Nil,
            kind: ResponseKind::Metadata,
            leading_metadata: Some(metadata),
            trailing_metadata: None,
        }
    }

    /// An ERROR frame. The payload is the encoded [`ErrorMessage`].
    pub fn error(seq: u64, error: ErrorMessage) -> Self {
        let data = rmpv::ext::to_value(&error).unwrap_or(Value::Nil);
        Self {
            seq,
            data,
            kind: ResponseKind::Error,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }

    /// Attach leading metadata to this frame.
    pub fn with_leading_metadata(mut self, metadata: Metadata) -> Self {
        self.leading_metadata = Some(metadata);
        self
    }

    /// Attach trailing metadata to this frame.
    pub fn with_trailing_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.trailing_metadata = metadata;
        self
    }

    /// Decode the payload as an [`ErrorMessage`]. Only meaningful for ERROR
    /// frames.
    pub fn error_message(&self) -> Option<ErrorMessage> {
        if self.kind != ResponseKind::Error {
            return None;
        }
        rmpv::ext::from_value(self.data.clone()).ok()
    }
}
