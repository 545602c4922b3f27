//! Protocol module - envelope model and request state machine.
//!
//! This module defines the typed view of the wire protocol:
//! - Request/response frame structs and their type enums
//! - The error payload and reserved error codes
//! - The per-request state machine that validates frame ordering

mod envelope;
mod state;

pub use envelope::{
    ErrorCode, ErrorMessage, Metadata, RequestFrame, RequestKind, ResponseFrame, ResponseKind,
};
pub use state::{
    InboundAction, ProtocolViolation, RequestState, RequestStateMachine, RpcShape,
};
