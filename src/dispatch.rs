//! Per-connection dispatcher.
//!
//! One dispatcher task per connection owns the request table and the single
//! write path to the transport. It selects over two sources:
//!
//! ```text
//! transport ──► decode ──► state machine ──► hooks ──► handler task (spawned)
//!                                                        │
//!            handlers ──► ResponseChannel ──► mpsc ──────┘
//!                                              │
//! transport ◄───────── serialize ◄─────────────┘  (outbound mux)
//! ```
//!
//! Frames for a given sequence are written in the order the handler
//! produced them; nothing is guaranteed across sequences. Frames for
//! cancelled or errored sequences are dropped at the mux, which is what
//! keeps the terminal frame strictly last.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_request, encode_response, FrameDecodeError};
use crate::config::Config;
use crate::connection::{normalize_close_code, ConnectionInfo};
use crate::error::{Result, SwillError};
use crate::handler::{
    error_payload, HandlerRegistry, InboundPayload, RequestInfo, ResponseChannel,
};
use crate::hooks::{shared_cell, unwrap_cell, HookArgs, HookPoint, LifecycleHooks};
use crate::protocol::{
    ErrorCode, ErrorMessage, InboundAction, Metadata, RequestFrame, RequestKind, RequestState,
    RequestStateMachine, ResponseFrame,
};

/// One frame on its way from a handler to the transport.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    /// The response frame to serialize.
    pub frame: ResponseFrame,
    /// Whether this frame terminates its request.
    pub terminal: bool,
}

/// Per-request bookkeeping owned by the dispatcher.
struct RequestEntry {
    info: Arc<RequestInfo>,
    machine: RequestStateMachine,
    /// Producer half of the inbound queue. `None` for unary-request shapes
    /// and after half-close; dropping it marks end of stream.
    feeder: Option<mpsc::Sender<Value>>,
    cancel: CancellationToken,
}

impl RequestEntry {
    fn absorbed(&self) -> bool {
        matches!(
            self.machine.state(),
            RequestState::Cancelled | RequestState::Errored
        )
    }
}

/// Demuxes inbound frames into requests and muxes handler output into the
/// transport.
pub(crate) struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    hooks: Arc<LifecycleHooks>,
    config: Arc<Config>,
    connection: Arc<ConnectionInfo>,
    requests: HashMap<u64, RequestEntry>,
    out_tx: mpsc::Sender<OutboundFrame>,
    out_rx: mpsc::Receiver<OutboundFrame>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        hooks: Arc<LifecycleHooks>,
        config: Arc<Config>,
        connection: Arc<ConnectionInfo>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        Self {
            registry,
            hooks,
            config,
            connection,
            requests: HashMap::new(),
            out_tx,
            out_rx,
        }
    }

    /// Drive the connection until the transport closes.
    pub(crate) async fn run<S>(mut self, ws: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        let outcome: Result<()> = loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = self.handle_frame(&data, &mut sink).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break Err(SwillError::ConnectionClosed);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        // Binary frames only; a text frame means the peer is
                        // not speaking swill.
                        tracing::warn!(
                            connection = %self.connection.id(),
                            "text frame received, closing connection"
                        );
                        break Err(SwillError::Protocol("text frames not allowed".to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(
                            connection = %self.connection.id(),
                            code = frame.as_ref().map(|f| u16::from(f.code)),
                            "websocket closed by peer"
                        );
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
                outbound = self.out_rx.recv() => {
                    if let Some(outbound) = outbound {
                        if let Err(e) = self.flush_outbound(outbound, &mut sink).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => {
                let _ = sink.send(Message::Close(None)).await;
            }
            Err(SwillError::CloseConnection { code, reason }) => {
                let close = CloseFrame {
                    code: CloseCode::from(normalize_close_code(*code)),
                    reason: reason.clone().into(),
                };
                let _ = sink.send(Message::Close(Some(close))).await;
            }
            Err(e) => {
                tracing::warn!(connection = %self.connection.id(), error = %e, "connection failed");
            }
        }

        self.teardown(&mut sink).await;

        match outcome {
            Err(SwillError::CloseConnection { .. }) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Decode and route one inbound binary message.
    async fn handle_frame<W>(&mut self, data: &[u8], sink: &mut W) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let frame = match decode_request(data) {
            Ok(frame) => frame,
            Err(FrameDecodeError {
                seq: Some(seq),
                reason,
            }) => {
                tracing::warn!(seq, %reason, "dropping undecodable frame");
                if let Some(entry) = self.requests.get_mut(&seq) {
                    entry.machine.on_errored();
                    entry.cancel.cancel();
                    entry.feeder = None;
                }
                Self::write_error(
                    sink,
                    seq,
                    ErrorMessage::reserved(
                        ErrorCode::InternalError,
                        format!("frame decode error: {reason}"),
                    ),
                )
                .await?;
                return Ok(());
            }
            // Unattributable garbage; the connection is beyond saving.
            Err(e) => return Err(e.into()),
        };

        if frame.seq == 0 {
            tracing::warn!("frame with reserved sequence 0");
            Self::write_error(
                sink,
                0,
                ErrorMessage::reserved(ErrorCode::InvalidArgument, "sequence 0 is reserved"),
            )
            .await?;
            return Ok(());
        }

        if self.requests.contains_key(&frame.seq) {
            self.process_existing(frame, sink).await
        } else {
            self.open_request(frame, sink).await
        }
    }

    /// Feed a frame into an already open request.
    async fn process_existing<W>(&mut self, frame: RequestFrame, sink: &mut W) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let seq = frame.seq;
        let Some(entry) = self.requests.get_mut(&seq) else {
            return Ok(());
        };

        let action = match entry.machine.on_inbound(frame.kind) {
            Ok(action) => action,
            Err(violation) => {
                tracing::warn!(seq, %violation, "protocol violation");
                entry.cancel.cancel();
                entry.feeder = None;
                return Self::write_error(
                    sink,
                    seq,
                    ErrorMessage::reserved(ErrorCode::InvalidArgument, violation.reason),
                )
                .await;
            }
        };

        match action {
            InboundAction::Ignore => {
                tracing::trace!(seq, kind = ?frame.kind, "ignoring frame");
                Ok(())
            }
            InboundAction::Cancel => {
                tracing::debug!(seq, "request cancelled by client");
                entry.cancel.cancel();
                entry.feeder = None;
                Ok(())
            }
            InboundAction::HalfClose => {
                tracing::trace!(seq, "client end of stream");
                entry.feeder = None;
                Ok(())
            }
            InboundAction::DeliverMetadata => {
                let info = entry.info.clone();
                let metadata = frame.metadata.unwrap_or_default();
                match self.run_metadata_hooks(&info, metadata).await {
                    Ok(metadata) => {
                        info.replace_metadata(metadata);
                        Ok(())
                    }
                    Err(e) => self.abort_request(seq, e, sink).await,
                }
            }
            InboundAction::DeliverMessage => {
                let info = entry.info.clone();
                let feeder = entry.feeder.clone();
                match self.run_inbound_data_hooks(&info, frame.data).await {
                    Ok(data) => {
                        if let Some(feeder) = feeder {
                            self.feed_inbound(seq, feeder, data, sink).await
                        } else {
                            tracing::debug!(seq, "no inbound queue, dropping message");
                            Ok(())
                        }
                    }
                    Err(e) => self.abort_request(seq, e, sink).await,
                }
            }
        }
    }

    /// First frame of a new sequence: classify, run hooks, launch the
    /// handler.
    async fn open_request<W>(&mut self, frame: RequestFrame, sink: &mut W) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let seq = frame.seq;

        if matches!(frame.kind, RequestKind::Cancel | RequestKind::EndOfStream) {
            tracing::warn!(
                seq,
                kind = ?frame.kind,
                "received control frame but that sequence is not open"
            );
            return Ok(());
        }

        let registry = self.registry.clone();
        let Some(entry) = registry.get(&frame.method) else {
            tracing::debug!(seq, method = %frame.method, "method not found");
            return Self::write_error(
                sink,
                seq,
                ErrorMessage::reserved(
                    ErrorCode::MethodNotFound,
                    format!("no handler registered for {:?}", frame.method),
                ),
            )
            .await;
        };
        let shape = entry.shape;

        let mut machine = RequestStateMachine::new(shape);
        let action = match machine.on_inbound(frame.kind) {
            Ok(action) => action,
            Err(violation) => {
                tracing::warn!(seq, %violation, "protocol violation on opening frame");
                // Keep a tombstone so later frames on this sequence are
                // ignored rather than re-opened.
                self.requests.insert(
                    seq,
                    RequestEntry {
                        info: Arc::new(RequestInfo::new(
                            seq,
                            frame.method,
                            shape,
                            frame.metadata.unwrap_or_default(),
                            self.connection.clone(),
                        )),
                        machine,
                        feeder: None,
                        cancel: CancellationToken::new(),
                    },
                );
                return Self::write_error(
                    sink,
                    seq,
                    ErrorMessage::reserved(ErrorCode::InvalidArgument, violation.reason),
                )
                .await;
            }
        };

        let cancel = CancellationToken::new();
        let info = Arc::new(RequestInfo::new(
            seq,
            frame.method.clone(),
            shape,
            frame.metadata.unwrap_or_default(),
            self.connection.clone(),
        ));

        if let Err(e) = self
            .hooks
            .run(HookPoint::BeforeRequest, HookArgs::for_request(info.clone()))
            .await
        {
            if matches!(e, SwillError::CloseConnection { .. }) {
                return Err(e);
            }
            tracing::debug!(seq, error = %e, "before_request hook aborted the request");
            return Self::write_error(sink, seq, error_payload(&e)).await;
        }

        // Standalone opening metadata runs its hook before the handler can
        // observe it.
        if action == InboundAction::DeliverMetadata {
            let metadata = info.metadata();
            match self.run_metadata_hooks(&info, metadata).await {
                Ok(metadata) => info.replace_metadata(metadata),
                Err(e) => {
                    if matches!(e, SwillError::CloseConnection { .. }) {
                        return Err(e);
                    }
                    return Self::write_error(sink, seq, error_payload(&e)).await;
                }
            }
        }

        let (inbound, feeder) = if shape.client_streams() {
            let (tx, rx) = mpsc::channel(self.config.inbound_queue_capacity.max(1));
            if action == InboundAction::DeliverMessage {
                match self.run_inbound_data_hooks(&info, frame.data).await {
                    Ok(data) => {
                        // Capacity is at least one, so the opening message
                        // always fits the empty queue.
                        let _ = tx.send(data).await;
                    }
                    Err(e) => {
                        if matches!(e, SwillError::CloseConnection { .. }) {
                            return Err(e);
                        }
                        return Self::write_error(sink, seq, error_payload(&e)).await;
                    }
                }
            }
            (InboundPayload::Stream(rx), Some(tx))
        } else {
            let data = match self.run_inbound_data_hooks(&info, frame.data).await {
                Ok(data) => data,
                Err(e) => {
                    if matches!(e, SwillError::CloseConnection { .. }) {
                        return Err(e);
                    }
                    return Self::write_error(sink, seq, error_payload(&e)).await;
                }
            };
            (InboundPayload::Unary(data), None)
        };

        let channel = Arc::new(ResponseChannel::new(
            info.clone(),
            self.hooks.clone(),
            self.out_tx.clone(),
            cancel.clone(),
        ));

        self.requests.insert(
            seq,
            RequestEntry {
                info: info.clone(),
                machine,
                feeder,
                cancel,
            },
        );

        tracing::debug!(seq, method = %info.method(), shape = ?shape, "launching handler");

        let fut = entry.handler.call(inbound, channel.clone());
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                match e {
                    SwillError::Cancelled => {
                        tracing::debug!(seq = info.seq(), "handler observed cancellation");
                    }
                    e => {
                        tracing::error!(
                            seq = info.seq(),
                            method = %info.method(),
                            error = %e,
                            "handler failed"
                        );
                        let _ = channel.send_error(error_payload(&e)).await;
                    }
                }
            }
            if let Err(e) = hooks
                .run(HookPoint::AfterRequest, HookArgs::for_request(info))
                .await
            {
                tracing::warn!(error = %e, "after_request hook failed");
            }
        });

        Ok(())
    }

    /// Feed one message into a request's inbound queue.
    ///
    /// While the queue is full this keeps draining the outbound mux, so a
    /// handler blocked writing responses can never deadlock against a
    /// dispatcher blocked feeding it.
    async fn feed_inbound<W>(
        &mut self,
        seq: u64,
        feeder: mpsc::Sender<Value>,
        data: Value,
        sink: &mut W,
    ) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let mut data = Some(data);
        loop {
            tokio::select! {
                permit = feeder.reserve() => {
                    match permit {
                        Ok(permit) => {
                            let Some(value) = data.take() else {
                                return Ok(());
                            };
                            permit.send(value);
                        }
                        Err(_) => {
                            // A closed reader means the handler stopped
                            // consuming; drop the message.
                            tracing::debug!(seq, "inbound queue closed, dropping message");
                        }
                    }
                    return Ok(());
                }
                outbound = self.out_rx.recv() => {
                    if let Some(outbound) = outbound {
                        self.flush_outbound(outbound, sink).await?;
                    }
                }
            }
        }
    }

    /// Run `before_request_data` then `before_request_message` over an
    /// inbound payload, returning the (possibly mutated) value.
    async fn run_inbound_data_hooks(
        &self,
        info: &Arc<RequestInfo>,
        data: Value,
    ) -> Result<Value> {
        let mut value = data;
        for point in [HookPoint::BeforeRequestData, HookPoint::BeforeRequestMessage] {
            if self.hooks.is_empty(point) {
                continue;
            }
            let cell = shared_cell(value);
            self.hooks
                .run(
                    point,
                    HookArgs::for_request(info.clone()).with_data(cell.clone()),
                )
                .await?;
            value = unwrap_cell(cell).await;
        }
        Ok(value)
    }

    async fn run_metadata_hooks(
        &self,
        info: &Arc<RequestInfo>,
        metadata: Metadata,
    ) -> Result<Metadata> {
        if self.hooks.is_empty(HookPoint::BeforeRequestMetadata) {
            return Ok(metadata);
        }
        let cell = shared_cell(metadata);
        self.hooks
            .run(
                HookPoint::BeforeRequestMetadata,
                HookArgs::for_request(info.clone()).with_metadata(cell.clone()),
            )
            .await?;
        Ok(unwrap_cell(cell).await)
    }

    /// A `before_request*` hook aborted: answer with ERROR and absorb the
    /// request.
    async fn abort_request<W>(&mut self, seq: u64, error: SwillError, sink: &mut W) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if matches!(error, SwillError::CloseConnection { .. }) {
            return Err(error);
        }
        if let Some(entry) = self.requests.get_mut(&seq) {
            entry.machine.on_errored();
            entry.cancel.cancel();
            entry.feeder = None;
        }
        Self::write_error(sink, seq, error_payload(&error)).await
    }

    /// Write one handler-produced frame to the transport.
    async fn flush_outbound<W>(&mut self, outbound: OutboundFrame, sink: &mut W) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let seq = outbound.frame.seq;
        let Some(entry) = self.requests.get_mut(&seq) else {
            tracing::trace!(seq, "dropping frame for closed sequence");
            return Ok(());
        };
        if entry.absorbed() {
            tracing::trace!(seq, "dropping frame for absorbed sequence");
            return Ok(());
        }

        let bytes = match encode_response(&outbound.frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(seq, error = %e, "failed to encode response frame");
                return Ok(());
            }
        };
        sink.send(Message::Binary(bytes.into())).await?;

        if outbound.terminal {
            entry.machine.on_terminal_sent();
            self.requests.remove(&seq);
        }
        Ok(())
    }

    async fn write_error<W>(sink: &mut W, seq: u64, error: ErrorMessage) -> Result<()>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let frame = ResponseFrame::error(seq, error);
        let bytes = encode_response(&frame)?;
        sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Best-effort flush, cancel everything, run `after_connection`.
    async fn teardown<S>(&mut self, sink: &mut SplitSink<WebSocketStream<S>, Message>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let flush = async {
            while let Ok(outbound) = self.out_rx.try_recv() {
                let still_open = self
                    .requests
                    .get(&outbound.frame.seq)
                    .map(|entry| !entry.absorbed())
                    .unwrap_or(false);
                if !still_open {
                    continue;
                }
                let Ok(bytes) = encode_response(&outbound.frame) else {
                    continue;
                };
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
                if outbound.terminal {
                    self.requests.remove(&outbound.frame.seq);
                }
            }
        };
        if tokio::time::timeout(self.config.close_flush_timeout, flush)
            .await
            .is_err()
        {
            tracing::debug!(
                connection = %self.connection.id(),
                "abandoning unflushed outbound frames"
            );
        }

        for (_, entry) in self.requests.drain() {
            entry.cancel.cancel();
        }

        if let Err(e) = self
            .hooks
            .run(
                HookPoint::AfterConnection,
                HookArgs::for_connection(self.connection.clone()),
            )
            .await
        {
            tracing::warn!(error = %e, "after_connection hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_response, encode_request};
    use crate::handler::{Request, Responder};
    use crate::protocol::ResponseKind;
    use crate::stream::StreamReader;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Drives a dispatcher over an in-memory WebSocket pair and exposes the
    /// client half as raw frames.
    struct Harness {
        ws: WebSocketStream<DuplexStream>,
    }

    impl Harness {
        async fn start(registry: HandlerRegistry) -> Self {
            Self::start_with(registry, LifecycleHooks::new()).await
        }

        async fn start_with(registry: HandlerRegistry, hooks: LifecycleHooks) -> Self {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let server_ws =
                WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            let client_ws =
                WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

            let connection = Arc::new(ConnectionInfo::new(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            )));
            let dispatcher = Dispatcher::new(
                Arc::new(registry),
                Arc::new(hooks),
                Arc::new(Config::default()),
                connection,
            );
            tokio::spawn(dispatcher.run(server_ws));

            Self { ws: client_ws }
        }

        async fn send(&mut self, frame: RequestFrame) {
            let bytes = encode_request(&frame).unwrap();
            self.ws.send(Message::Binary(bytes.into())).await.unwrap();
        }

        async fn recv(&mut self) -> ResponseFrame {
            loop {
                match self.ws.next().await.expect("connection open").unwrap() {
                    Message::Binary(data) => return decode_response(&data).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => panic!("unexpected message: {other:?}"),
                }
            }
        }
    }

    fn test_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .unary("add", |request: Request<(i64, i64)>, _ctx| async move {
                let (a, b) = request.into_data();
                Ok(a + b)
            })
            .unwrap();
        registry
            .server_streaming(
                "count",
                |request: Request<u64>, out: Responder<u64>, _ctx| async move {
                    for i in 0..request.into_data() {
                        out.send(&i).await?;
                    }
                    Ok(())
                },
            )
            .unwrap();
        registry
            .client_streaming("sum", |mut numbers: StreamReader<i64>, _ctx| async move {
                let mut total = 0;
                while let Some(n) = numbers.next().await? {
                    total += n;
                }
                Ok(total)
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let mut harness = Harness::start(test_registry()).await;

        let args = crate::codec::MsgPackCodec::to_value(&(1i64, 2i64)).unwrap();
        harness.send(RequestFrame::message(1, "add", args)).await;

        let response = harness.recv().await;
        assert_eq!(response.seq, 1);
        assert_eq!(response.kind, ResponseKind::Message);
        assert_eq!(response.data, Value::from(3i64));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut harness = Harness::start(test_registry()).await;

        harness
            .send(RequestFrame::message(5, "nope", Value::Nil))
            .await;

        let response = harness.recv().await;
        assert_eq!(response.seq, 5);
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.error_message().unwrap().code, 404);
    }

    #[tokio::test]
    async fn test_server_stream_emits_end_of_stream() {
        let mut harness = Harness::start(test_registry()).await;

        harness
            .send(RequestFrame::message(2, "count", Value::from(3u64)))
            .await;

        for expected in 0..3u64 {
            let response = harness.recv().await;
            assert_eq!(response.kind, ResponseKind::Message);
            assert_eq!(response.data, Value::from(expected));
        }
        let end = harness.recv().await;
        assert_eq!(end.kind, ResponseKind::EndOfStream);
    }

    #[tokio::test]
    async fn test_client_stream_sum() {
        let mut harness = Harness::start(test_registry()).await;

        for n in [1i64, 2, 3] {
            harness
                .send(RequestFrame::message(3, "sum", Value::from(n)))
                .await;
        }
        harness.send(RequestFrame::end_of_stream(3, "sum")).await;

        let response = harness.recv().await;
        assert_eq!(response.kind, ResponseKind::Message);
        assert_eq!(response.data, Value::from(6i64));
    }

    #[tokio::test]
    async fn test_message_after_end_of_stream_errors() {
        let mut registry = HandlerRegistry::new();
        // Stays open after draining, so the request is still live when the
        // offending frame arrives.
        registry
            .client_streaming("slow_sum", |mut numbers: StreamReader<i64>, _ctx| {
                async move {
                    let mut total = 0;
                    while let Some(n) = numbers.next().await? {
                        total += n;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok(total)
                }
            })
            .unwrap();
        let mut harness = Harness::start(registry).await;

        harness
            .send(RequestFrame::message(4, "slow_sum", Value::from(1i64)))
            .await;
        harness
            .send(RequestFrame::end_of_stream(4, "slow_sum"))
            .await;
        harness
            .send(RequestFrame::message(4, "slow_sum", Value::from(2i64)))
            .await;

        let response = harness.recv().await;
        assert_eq!(response.seq, 4);
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.error_message().unwrap().code, 400);

        // The handler's late response is dropped at the mux: nothing else
        // arrives for this sequence.
        let next = tokio::time::timeout(
            std::time::Duration::from_millis(400),
            harness.ws.next(),
        )
        .await;
        assert!(next.is_err(), "no frames may follow the terminal error");
    }

    #[tokio::test]
    async fn test_cancel_stops_stream() {
        let mut registry = test_registry();
        registry
            .server_streaming(
                "forever",
                |_request: Request<Value>, out: Responder<u64>, _ctx| async move {
                    let mut i = 0u64;
                    loop {
                        out.send(&i).await?;
                        i += 1;
                    }
                },
            )
            .unwrap();
        let mut harness = Harness::start(registry).await;

        harness
            .send(RequestFrame::message(4, "forever", Value::Nil))
            .await;

        harness.recv().await;
        harness.recv().await;
        harness.send(RequestFrame::cancel(4, "forever")).await;

        // Give the cancellation time to propagate, then drain whatever was
        // already in flight for seq 4.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        loop {
            match tokio::time::timeout(
                std::time::Duration::from_millis(50),
                harness.ws.next(),
            )
            .await
            {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    assert_eq!(decode_response(&data).unwrap().seq, 4);
                }
                Ok(Some(Ok(_))) => continue,
                _ => break,
            }
        }

        // The connection stays usable and no further seq-4 frames appear.
        harness
            .send(RequestFrame::message(5, "count", Value::from(1u64)))
            .await;
        let message = harness.recv().await;
        assert_eq!(message.seq, 5);
        assert_eq!(message.data, Value::from(0u64));
        let end = harness.recv().await;
        assert_eq!(end.seq, 5);
        assert_eq!(end.kind, ResponseKind::EndOfStream);
    }

    #[tokio::test]
    async fn test_unary_rejects_second_message() {
        let mut registry = HandlerRegistry::new();
        registry
            .unary("slow", |_request: Request<Value>, _ctx| async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(Value::Nil)
            })
            .unwrap();
        let mut harness = Harness::start(registry).await;

        // Both messages land while the handler is still sleeping; the
        // second is a protocol error on a unary request.
        harness
            .send(RequestFrame::message(7, "slow", Value::Nil))
            .await;
        harness
            .send(RequestFrame::message(7, "slow", Value::Nil))
            .await;

        let response = harness.recv().await;
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.error_message().unwrap().code, 400);
    }

    #[tokio::test]
    async fn test_before_request_hook_abort() {
        let mut hooks = LifecycleHooks::new();
        hooks.on(HookPoint::BeforeRequest, |args: HookArgs| async move {
            let request = args.request.as_ref().expect("request hook");
            if request.method() == "add" {
                Err(SwillError::rpc(403, "add is forbidden"))
            } else {
                Ok(())
            }
        });
        let mut harness = Harness::start_with(test_registry(), hooks).await;

        let args = crate::codec::MsgPackCodec::to_value(&(1i64, 2i64)).unwrap();
        harness.send(RequestFrame::message(1, "add", args)).await;

        let response = harness.recv().await;
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.error_message().unwrap().code, 403);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_frame() {
        let mut registry = HandlerRegistry::new();
        registry
            .unary("fail", |_request: Request<Value>, ctx| async move {
                Err::<Value, _>(ctx.abort(503, "not today"))
            })
            .unwrap();
        let mut harness = Harness::start(registry).await;

        harness
            .send(RequestFrame::message(1, "fail", Value::Nil))
            .await;

        let response = harness.recv().await;
        assert_eq!(response.kind, ResponseKind::Error);
        let error = response.error_message().unwrap();
        assert_eq!(error.code, 503);
        assert_eq!(error.message, "not today");
    }

    #[tokio::test]
    async fn test_invalid_payload_is_invalid_argument() {
        let mut harness = Harness::start(test_registry()).await;

        // add expects a pair of integers.
        harness
            .send(RequestFrame::message(1, "add", Value::from("garbage")))
            .await;

        let response = harness.recv().await;
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.error_message().unwrap().code, 400);
    }
}
