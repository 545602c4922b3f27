//! Request context and response plumbing for handlers.
//!
//! Every request gets one [`ResponseChannel`]: the single outbound path for
//! its frames. It enforces the metadata ordering rules (leading metadata is
//! locked after the first outbound frame, trailing metadata rides the
//! terminal frame), runs the response-side lifecycle hooks, and guarantees
//! the request terminates exactly once.
//!
//! Handlers see two thin views over it: [`Context`] (metadata, connection
//! state, cancellation) and [`Responder`] (typed streaming sends).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rmpv::Value;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::MsgPackCodec;
use crate::connection::ConnectionInfo;
use crate::dispatch::OutboundFrame;
use crate::error::{Result, SwillError};
use crate::hooks::{shared_cell, unwrap_cell, HookArgs, HookPoint, LifecycleHooks};
use crate::protocol::{ErrorMessage, Metadata, ResponseFrame, RpcShape};

/// Immutable facts about a request, shared with hooks and handlers.
pub struct RequestInfo {
    seq: u64,
    method: String,
    shape: RpcShape,
    metadata: Mutex<Metadata>,
    connection: Arc<ConnectionInfo>,
}

impl RequestInfo {
    pub(crate) fn new(
        seq: u64,
        method: impl Into<String>,
        shape: RpcShape,
        metadata: Metadata,
        connection: Arc<ConnectionInfo>,
    ) -> Self {
        Self {
            seq,
            method: method.into(),
            shape,
            metadata: Mutex::new(metadata),
            connection,
        }
    }

    /// Sequence number of this request.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Name of the procedure being called.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call shape the method was registered with.
    pub fn shape(&self) -> RpcShape {
        self.shape
    }

    /// Snapshot of the client-supplied leading metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The connection this request arrived on.
    pub fn connection(&self) -> Arc<ConnectionInfo> {
        self.connection.clone()
    }

    pub(crate) fn replace_metadata(&self, metadata: Metadata) {
        *self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = metadata;
    }
}

impl std::fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInfo")
            .field("seq", &self.seq)
            .field("method", &self.method)
            .field("shape", &self.shape)
            .finish()
    }
}

/// A decoded unary request payload plus its request facts.
pub struct Request<T> {
    data: T,
    info: Arc<RequestInfo>,
}

impl<T> Request<T> {
    pub(crate) fn new(data: T, info: Arc<RequestInfo>) -> Self {
        Self { data, info }
    }

    /// The decoded payload.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Consume the request, returning the payload.
    pub fn into_data(self) -> T {
        self.data
    }

    /// Sequence number of this request.
    pub fn seq(&self) -> u64 {
        self.info.seq()
    }

    /// Client-supplied leading metadata.
    pub fn metadata(&self) -> Metadata {
        self.info.metadata()
    }
}

enum LeadingState {
    Unset,
    Pending(Metadata),
    Locked,
}

/// The single outbound path for one request's frames.
pub(crate) struct ResponseChannel {
    request: Arc<RequestInfo>,
    hooks: Arc<LifecycleHooks>,
    out_tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    leading: Mutex<LeadingState>,
    trailing: Mutex<Option<Metadata>>,
    terminal_sent: AtomicBool,
}

impl ResponseChannel {
    pub(crate) fn new(
        request: Arc<RequestInfo>,
        hooks: Arc<LifecycleHooks>,
        out_tx: mpsc::Sender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            hooks,
            out_tx,
            cancel,
            leading: Mutex::new(LeadingState::Unset),
            trailing: Mutex::new(None),
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn request(&self) -> Arc<RequestInfo> {
        self.request.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn seq(&self) -> u64 {
        self.request.seq()
    }

    /// Stage leading metadata, optionally pushing it out as a standalone
    /// METADATA frame right away.
    ///
    /// Once any outbound MESSAGE or METADATA frame has been sent, leading
    /// metadata is locked and later attempts are silently ignored.
    pub(crate) async fn set_leading_metadata(
        &self,
        metadata: Metadata,
        send_immediately: bool,
    ) -> Result<()> {
        {
            let mut state = self.leading.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                LeadingState::Locked => {
                    tracing::debug!(
                        seq = self.seq(),
                        "leading metadata already sent, ignoring late set"
                    );
                    return Ok(());
                }
                _ => *state = LeadingState::Pending(metadata),
            }
        }

        if send_immediately {
            let metadata = self.consume_leading().await?;
            if let Some(metadata) = metadata {
                let frame = ResponseFrame::metadata(self.seq(), metadata);
                self.enqueue(frame, false).await?;
            }
        }
        Ok(())
    }

    /// Record trailing metadata for the terminal frame.
    pub(crate) fn set_trailing_metadata(&self, metadata: Metadata) {
        *self
            .trailing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metadata);
    }

    /// Take the pending leading metadata and lock it, running the
    /// `before_leading_metadata` hooks. Returns `None` when already locked
    /// or nothing was set.
    async fn consume_leading(&self) -> Result<Option<Metadata>> {
        let pending = {
            let mut state = self.leading.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, LeadingState::Locked) {
                LeadingState::Pending(metadata) => Some(metadata),
                LeadingState::Unset => Some(Metadata::new()),
                LeadingState::Locked => None,
            }
        };

        let Some(metadata) = pending else {
            return Ok(None);
        };

        let metadata = if self.hooks.is_empty(HookPoint::BeforeLeadingMetadata) {
            metadata
        } else {
            let cell = shared_cell(metadata);
            self.hooks
                .run(
                    HookPoint::BeforeLeadingMetadata,
                    HookArgs::for_request(self.request()).with_metadata(cell.clone()),
                )
                .await?;
            unwrap_cell(cell).await
        };

        if metadata.is_empty() {
            Ok(None)
        } else {
            Ok(Some(metadata))
        }
    }

    /// Take the trailing metadata, running the `before_trailing_metadata`
    /// hooks. Hooks may inject entries even when the handler set none.
    async fn consume_trailing(&self) -> Result<Option<Metadata>> {
        let metadata = self
            .trailing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();

        let metadata = if self.hooks.is_empty(HookPoint::BeforeTrailingMetadata) {
            metadata
        } else {
            let cell = shared_cell(metadata);
            self.hooks
                .run(
                    HookPoint::BeforeTrailingMetadata,
                    HookArgs::for_request(self.request()).with_metadata(cell.clone()),
                )
                .await?;
            unwrap_cell(cell).await
        };

        if metadata.is_empty() {
            Ok(None)
        } else {
            Ok(Some(metadata))
        }
    }

    /// Send one streaming MESSAGE frame.
    pub(crate) async fn send_message(&self, data: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SwillError::Cancelled);
        }
        if self.terminal_sent.load(Ordering::Acquire) {
            return Err(SwillError::Protocol(
                "response already terminated".to_string(),
            ));
        }

        let data = self.run_message_hooks(data).await?;
        let leading = self.consume_leading().await?;

        let mut frame = ResponseFrame::message(self.seq(), data);
        if let Some(metadata) = leading {
            frame = frame.with_leading_metadata(metadata);
        }
        self.enqueue(frame, false).await
    }

    /// Send the single terminal MESSAGE of a unary response.
    pub(crate) async fn send_unary(&self, data: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SwillError::Cancelled);
        }
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let data = match self.run_message_hooks(data).await {
            Ok(data) => data,
            Err(e) => {
                // Hook abort: the terminal flag is ours, emit the
                // replacement error frame directly.
                self.emit_error_frame(error_payload(&e)).await?;
                return Err(e);
            }
        };
        let leading = self.consume_leading().await?;
        let trailing = self.consume_trailing().await?;

        let mut frame = ResponseFrame::message(self.seq(), data);
        if let Some(metadata) = leading {
            frame = frame.with_leading_metadata(metadata);
        }
        self.enqueue(frame.with_trailing_metadata(trailing), true).await
    }

    /// Send the terminal END_OF_STREAM of a streaming response.
    pub(crate) async fn send_end(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let leading = self.consume_leading().await?;
        let trailing = self.consume_trailing().await?;

        let mut frame = ResponseFrame::end_of_stream(self.seq());
        if let Some(metadata) = leading {
            frame = frame.with_leading_metadata(metadata);
        }
        self.enqueue(frame.with_trailing_metadata(trailing), true).await
    }

    /// Send a terminal ERROR frame. Dropped silently after cancellation or
    /// a previous terminal.
    pub(crate) async fn send_error(&self, error: ErrorMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.emit_error_frame(error).await
    }

    async fn emit_error_frame(&self, error: ErrorMessage) -> Result<()> {
        // Trailing metadata still rides the terminal frame; a failing
        // trailing hook forfeits the metadata, not the error.
        let trailing = self.consume_trailing().await.unwrap_or(None);
        let frame = ResponseFrame::error(self.seq(), error).with_trailing_metadata(trailing);
        self.enqueue(frame, true).await
    }

    async fn run_message_hooks(&self, data: Value) -> Result<Value> {
        if self.hooks.is_empty(HookPoint::BeforeResponseMessage) {
            return Ok(data);
        }
        let cell = shared_cell(data);
        self.hooks
            .run(
                HookPoint::BeforeResponseMessage,
                HookArgs::for_request(self.request()).with_data(cell.clone()),
            )
            .await?;
        Ok(unwrap_cell(cell).await)
    }

    async fn enqueue(&self, frame: ResponseFrame, terminal: bool) -> Result<()> {
        self.out_tx
            .send(OutboundFrame { frame, terminal })
            .await
            .map_err(|_| SwillError::ConnectionClosed)
    }
}

/// Build the wire error payload for a handler failure.
pub(crate) fn error_payload(error: &SwillError) -> ErrorMessage {
    use crate::protocol::ErrorCode;
    match error {
        SwillError::Rpc(message) => message.clone(),
        SwillError::Decode(reason) => ErrorMessage::reserved(
            ErrorCode::InvalidArgument,
            format!("invalid payload: {reason}"),
        ),
        _ => ErrorMessage::reserved(ErrorCode::InternalError, "internal server error"),
    }
}

/// Context passed to request handlers.
///
/// Carries the connection state, the request's metadata views, and the
/// send-once metadata surfaces of the response.
#[derive(Clone)]
pub struct Context {
    channel: Arc<ResponseChannel>,
}

impl Context {
    pub(crate) fn new(channel: Arc<ResponseChannel>) -> Self {
        Self { channel }
    }

    /// The connection this request arrived on.
    pub fn connection(&self) -> Arc<ConnectionInfo> {
        self.channel.request.connection()
    }

    /// Sequence number of this request.
    pub fn seq(&self) -> u64 {
        self.channel.request.seq()
    }

    /// Name of the procedure being called.
    pub fn method(&self) -> &str {
        &self.channel.request.method
    }

    /// Client-supplied leading metadata.
    pub fn metadata(&self) -> Metadata {
        self.channel.request.metadata()
    }

    /// Set leading metadata for the response. Can only take effect once;
    /// after any outbound frame it is silently ignored.
    ///
    /// With `send_immediately` the metadata goes out as a standalone
    /// METADATA frame; otherwise it rides the first response message.
    pub async fn set_leading_metadata(
        &self,
        metadata: Metadata,
        send_immediately: bool,
    ) -> Result<()> {
        self.channel
            .set_leading_metadata(metadata, send_immediately)
            .await
    }

    /// Set trailing metadata, carried on the terminal response frame.
    pub fn set_trailing_metadata(&self, metadata: Metadata) {
        self.channel.set_trailing_metadata(metadata);
    }

    /// Build an error that fails this request with the given code.
    ///
    /// ```ignore
    /// return Err(ctx.abort(403, "not allowed"));
    /// ```
    pub fn abort(&self, code: i64, message: impl Into<String>) -> SwillError {
        SwillError::rpc(code, message)
    }

    /// Whether the client has cancelled this request.
    pub fn cancelled(&self) -> bool {
        self.channel.cancel.is_cancelled()
    }

    /// The request's cancellation signal, for use in `select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.channel.cancel_token()
    }
}

/// Typed sender for streaming response messages.
pub struct Responder<R> {
    channel: Arc<ResponseChannel>,
    _marker: PhantomData<fn(R)>,
}

impl<R: Serialize> Responder<R> {
    pub(crate) fn new(channel: Arc<ResponseChannel>) -> Self {
        Self {
            channel,
            _marker: PhantomData,
        }
    }

    /// Send one response message.
    ///
    /// Suspends while the outbound channel is full. Fails with
    /// [`SwillError::Cancelled`] once the request has been cancelled; the
    /// handler should return promptly when it sees that.
    pub async fn send(&self, item: &R) -> Result<()> {
        let value = MsgPackCodec::to_value(item)?;
        self.channel.send_message(value).await
    }
}

impl<R> Clone for Responder<R> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            _marker: PhantomData,
        }
    }
}
