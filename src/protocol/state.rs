//! Per-request state machine.
//!
//! Validates the sequence of inbound frames for one request and drives its
//! lifecycle:
//!
//! ```text
//! NEW ──► OPEN ──► HALF_CLOSED_REMOTE ──► CLOSED
//!           │               │
//!           ▼               ▼
//!       CANCELLED        ERRORED   (absorbing)
//! ```
//!
//! The dispatcher feeds every inbound frame kind through
//! [`RequestStateMachine::on_inbound`]; a [`ProtocolViolation`] means the
//! offending sequence must be answered with ERROR(invalid-argument) and the
//! machine has absorbed into `Errored`. Frames arriving in an absorbing
//! state are ignored.

use crate::protocol::RequestKind;

/// Lifecycle states of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created, first frame not yet processed.
    New,
    /// Both directions open.
    Open,
    /// Client sent END_OF_STREAM; server may still respond.
    HalfClosedRemote,
    /// Terminal outbound frame sent.
    Closed,
    /// Client sent CANCEL. Absorbing.
    Cancelled,
    /// A protocol violation was answered with an error. Absorbing.
    Errored,
}

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcShape {
    /// Single request message, single response message.
    Unary,
    /// Stream of request messages, single response message.
    ClientStream,
    /// Single request message, stream of response messages.
    ServerStream,
    /// Streams in both directions.
    Duplex,
}

impl RpcShape {
    /// Whether the client side sends a stream of messages.
    #[inline]
    pub fn client_streams(self) -> bool {
        matches!(self, RpcShape::ClientStream | RpcShape::Duplex)
    }

    /// Whether the server side sends a stream of messages.
    #[inline]
    pub fn server_streams(self) -> bool {
        matches!(self, RpcShape::ServerStream | RpcShape::Duplex)
    }
}

/// What the dispatcher should do with a validated inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    /// Deliver the payload to the handler.
    DeliverMessage,
    /// Merge the frame's metadata into the request's leading metadata.
    DeliverMetadata,
    /// Close the inbound queue; the client will send no more data.
    HalfClose,
    /// Fire the cancellation signal and drop pending outbound frames.
    Cancel,
    /// Drop the frame. Absorbing states and duplicate END_OF_STREAM land
    /// here.
    Ignore,
}

/// An out-of-order or shape-illegal frame.
///
/// The machine has already absorbed into `Errored` when this is returned;
/// the caller's only job is to answer with ERROR(invalid-argument).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    /// What the peer did wrong.
    pub reason: String,
}

impl ProtocolViolation {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Frame-sequence validator for a single request.
#[derive(Debug)]
pub struct RequestStateMachine {
    shape: RpcShape,
    state: RequestState,
    message_seen: bool,
    metadata_seen: bool,
}

impl RequestStateMachine {
    /// Create a machine for a freshly created request.
    pub fn new(shape: RpcShape) -> Self {
        Self {
            shape,
            state: RequestState::New,
            message_seen: false,
            metadata_seen: false,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Call shape this request was classified as.
    #[inline]
    pub fn shape(&self) -> RpcShape {
        self.shape
    }

    /// Whether the request has reached an absorbing or closed state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RequestState::Closed | RequestState::Cancelled | RequestState::Errored
        )
    }

    /// Validate one inbound frame kind and advance the machine.
    pub fn on_inbound(
        &mut self,
        kind: RequestKind,
    ) -> Result<InboundAction, ProtocolViolation> {
        if self.is_terminal() {
            return Ok(InboundAction::Ignore);
        }

        if self.state == RequestState::New {
            self.state = RequestState::Open;
        }

        match kind {
            RequestKind::Message => self.on_message(),
            RequestKind::Metadata => self.on_metadata(),
            RequestKind::EndOfStream => self.on_end_of_stream(),
            RequestKind::Cancel => {
                self.state = RequestState::Cancelled;
                Ok(InboundAction::Cancel)
            }
        }
    }

    fn on_message(&mut self) -> Result<InboundAction, ProtocolViolation> {
        if self.state == RequestState::HalfClosedRemote {
            return Err(self.violation("message received after end of stream"));
        }
        if !self.shape.client_streams() && self.message_seen {
            return Err(self.violation("unary request accepts a single message"));
        }
        self.message_seen = true;
        Ok(InboundAction::DeliverMessage)
    }

    fn on_metadata(&mut self) -> Result<InboundAction, ProtocolViolation> {
        if !self.shape.client_streams() {
            return Err(self.violation("standalone metadata is only valid for streaming requests"));
        }
        if self.state == RequestState::HalfClosedRemote {
            return Err(self.violation("metadata received after end of stream"));
        }
        if self.message_seen {
            return Err(self.violation("metadata must precede the first message"));
        }
        if self.metadata_seen {
            return Err(self.violation("leading metadata can only be sent once"));
        }
        self.metadata_seen = true;
        Ok(InboundAction::DeliverMetadata)
    }

    fn on_end_of_stream(&mut self) -> Result<InboundAction, ProtocolViolation> {
        if !self.shape.client_streams() {
            return Err(self.violation("end of stream is only valid for streaming requests"));
        }
        if self.state == RequestState::HalfClosedRemote {
            return Ok(InboundAction::Ignore);
        }
        self.state = RequestState::HalfClosedRemote;
        Ok(InboundAction::HalfClose)
    }

    /// Record that the terminal outbound frame was flushed.
    ///
    /// No-op when the request already absorbed into `Cancelled` or
    /// `Errored`; a request terminates exactly once.
    pub fn on_terminal_sent(&mut self) {
        if !self.is_terminal() {
            self.state = RequestState::Closed;
        }
    }

    /// Absorb into `Cancelled` (transport teardown path).
    pub fn on_cancelled(&mut self) {
        if !self.is_terminal() {
            self.state = RequestState::Cancelled;
        }
    }

    /// Absorb into `Errored` (frame decode failures, hook aborts).
    pub fn on_errored(&mut self) {
        if !self.is_terminal() {
            self.state = RequestState::Errored;
        }
    }

    fn violation(&mut self, reason: &str) -> ProtocolViolation {
        self.state = RequestState::Errored;
        ProtocolViolation::new(reason)
    }
}
