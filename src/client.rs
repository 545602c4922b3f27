//! The swill client.
//!
//! [`Client::connect`] establishes the WebSocket, then a background io task
//! owns the connection: it multiplexes outbound request frames and routes
//! inbound response frames to the [`RpcRequest`] that opened each sequence.
//!
//! A supervisor task watches the io task. When the connection drops with a
//! reconnectable close (abnormal closure 1006, TLS failure 1015, or any
//! non-clean close) it schedules reconnect attempts with
//! `delay = base * backoff_factor * attempts + jitter`, capped by
//! `retries`. A successful reconnect resets the attempt counter and
//! reinitializes all per-connection state: sequence counter and request
//! table start fresh, and requests that were in flight fail with
//! [`SwillError::ConnectionClosed`].
//!
//! # Example
//!
//! ```ignore
//! let client = Client::connect("ws://127.0.0.1:4700").await?;
//!
//! let sum: Option<i64> = client.call("add", &(1i64, 2i64)).await?;
//! assert_eq!(sum, Some(3));
//!
//! let mut stream = client.rpc::<u64, u64>("count", Some(&3), CallOptions::default()).await?;
//! while let RpcEvent::Message(n) = stream.receive().await? {
//!     println!("{n}");
//! }
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_response, encode_request, MsgPackCodec};
use crate::connection::connect_websocket;
use crate::error::{Result, SwillError};
use crate::protocol::{
    ErrorCode, ErrorMessage, Metadata, RequestFrame, ResponseFrame, ResponseKind,
};

/// Default client connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect scheduling knobs.
///
/// Delay for the nth attempt is
/// `base_delay * backoff_factor * n + jitter`, with jitter sampled
/// uniformly from `[min_jitter, max_jitter]`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay unit.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Lower jitter bound.
    pub min_jitter: Duration,
    /// Upper jitter bound (must be ≥ `min_jitter`).
    pub max_jitter: Duration,
    /// Maximum scheduled attempts per disconnect before giving up.
    pub retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            backoff_factor: 1.0,
            min_jitter: Duration::ZERO,
            max_jitter: Duration::from_millis(250),
            retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the nth (1-based) attempt, with the given jitter.
    pub fn delay_for(&self, attempts: u32, jitter: Duration) -> Duration {
        self.base_delay
            .mul_f64(self.backoff_factor * attempts as f64)
            + jitter
    }

    /// Sample a jitter uniformly from the configured range.
    pub fn sample_jitter(&self) -> Duration {
        if self.max_jitter <= self.min_jitter {
            return self.min_jitter;
        }
        let secs = rand::thread_rng()
            .gen_range(self.min_jitter.as_secs_f64()..=self.max_jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Reconnect scheduling policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Leading metadata, carried with the first frame.
    pub metadata: Option<Metadata>,
    /// Emit the metadata as a standalone METADATA frame when the request
    /// opens without initial args.
    pub send_metadata_first: bool,
    /// Deadline after which a CANCEL is sent and the call fails with
    /// deadline-exceeded.
    pub timeout: Option<Duration>,
}

/// Connection liveness as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Connected and usable.
    Connected,
    /// Disconnected; the scheduler is attempting to reconnect.
    Reconnecting,
    /// Disconnected for good (clean close or retries exhausted).
    Disconnected,
}

/// One inbound event on an open request.
#[derive(Debug)]
pub enum RpcEvent<R> {
    /// A response message.
    Message(R),
    /// The server finished the stream.
    EndOfStream,
    /// The server failed the request. Inspect the payload; `receive` never
    /// turns inbound errors into `Err`.
    Error(ErrorMessage),
}

enum IoCommand {
    Register {
        seq: u64,
        tx: mpsc::UnboundedSender<ResponseFrame>,
    },
    Deregister {
        seq: u64,
    },
    Send(RequestFrame),
    Close,
}

/// Why the io task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectKind {
    /// Clean close; do not reconnect.
    Clean,
    /// Eligible for reconnection.
    Reconnectable,
}

/// Per-connection state: command channel and sequence allocator. Replaced
/// wholesale on every reconnect.
struct Epoch {
    cmd_tx: mpsc::Sender<IoCommand>,
    next_seq: AtomicU64,
}

impl Epoch {
    fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_command(&self, command: IoCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SwillError::ConnectionClosed)
    }

    fn try_deregister(&self, seq: u64) {
        let _ = self.cmd_tx.try_send(IoCommand::Deregister { seq });
    }
}

struct ClientInner {
    url: String,
    config: ClientConfig,
    epoch: Mutex<Option<Arc<Epoch>>>,
    status: watch::Sender<ClientStatus>,
}

impl ClientInner {
    fn set_status(&self, status: ClientStatus) {
        let _ = self.status.send(status);
    }

    fn current_epoch(&self) -> Result<Arc<Epoch>> {
        self.epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SwillError::ConnectionClosed)
    }

    fn install_epoch(&self, epoch: Option<Arc<Epoch>>) {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    async fn connect_epoch(&self) -> Result<(Arc<Epoch>, JoinHandle<DisconnectKind>)> {
        let ws = connect_websocket(&self.url, self.config.connect_timeout).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let epoch = Arc::new(Epoch {
            cmd_tx,
            next_seq: AtomicU64::new(1),
        });
        let task = tokio::spawn(io_task(ws, cmd_rx));
        Ok((epoch, task))
    }
}

/// A connected swill client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect with default configuration.
    pub async fn connect(url: impl Into<String>) -> Result<Client> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    /// Connect with explicit configuration.
    ///
    /// Failed attempts engage the reconnect scheduler; once the retry cap
    /// is exceeded this returns [`SwillError::RetriesExhausted`].
    pub async fn connect_with(url: impl Into<String>, config: ClientConfig) -> Result<Client> {
        let (status, _) = watch::channel(ClientStatus::Reconnecting);
        let inner = Arc::new(ClientInner {
            url: url.into(),
            config,
            epoch: Mutex::new(None),
            status,
        });

        let mut attempts = 0u32;
        let (epoch, task) = loop {
            match inner.connect_epoch().await {
                Ok(connected) => break connected,
                Err(e) => {
                    attempts += 1;
                    if attempts > inner.config.reconnect.retries {
                        inner.set_status(ClientStatus::Disconnected);
                        tracing::warn!(attempts, error = %e, "connect attempts exhausted");
                        return Err(SwillError::RetriesExhausted { attempts });
                    }
                    let delay = inner
                        .config
                        .reconnect
                        .delay_for(attempts, inner.config.reconnect.sample_jitter());
                    tracing::warn!(attempts, ?delay, error = %e, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        inner.install_epoch(Some(epoch));
        inner.set_status(ClientStatus::Connected);
        tokio::spawn(supervise(inner.clone(), task));

        Ok(Client { inner })
    }

    /// Current connection status.
    pub fn status(&self) -> ClientStatus {
        *self.inner.status.borrow()
    }

    /// Watch status transitions.
    pub fn status_stream(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    /// Close the connection cleanly. No reconnect is scheduled.
    pub async fn close(&self) {
        let epoch = self
            .inner
            .epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(epoch) = epoch {
            let _ = epoch.send_command(IoCommand::Close).await;
        }
    }

    /// Unary call: send `args`, wait for the response.
    ///
    /// Returns `Ok(Some(value))` on a MESSAGE, `Ok(None)` on END_OF_STREAM
    /// without a prior message, and `Err(SwillError::Rpc)` on an ERROR.
    pub async fn call<T, R>(&self, method: &str, args: &T) -> Result<Option<R>>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// Unary call with options.
    pub async fn call_with<T, R>(
        &self,
        method: &str,
        args: &T,
        options: CallOptions,
    ) -> Result<Option<R>>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let deadline = options.timeout;
        let mut request = self.rpc::<T, R>(method, Some(args), options).await?;

        let event = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, request.receive()).await {
                Ok(event) => event?,
                Err(_) => {
                    let _ = request.cancel().await;
                    return Err(SwillError::Rpc(ErrorMessage::reserved(
                        ErrorCode::DeadlineExceeded,
                        format!("no response within {deadline:?}"),
                    )));
                }
            },
            None => request.receive().await?,
        };

        match event {
            RpcEvent::Message(value) => Ok(Some(value)),
            RpcEvent::EndOfStream => Ok(None),
            RpcEvent::Error(error) => Err(SwillError::Rpc(error)),
        }
    }

    /// Open a request and return its handle.
    ///
    /// With `args` the request opens with a MESSAGE frame (metadata riding
    /// along); without, a standalone METADATA frame is emitted when
    /// `send_metadata_first` is set, otherwise the first
    /// [`RpcRequest::send`] carries the metadata.
    pub async fn rpc<T, R>(
        &self,
        method: &str,
        args: Option<&T>,
        options: CallOptions,
    ) -> Result<RpcRequest<T, R>>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let epoch = self.inner.current_epoch()?;
        let seq = epoch.allocate_seq();

        let (tx, rx) = mpsc::unbounded_channel();
        epoch.send_command(IoCommand::Register { seq, tx }).await?;

        let mut request = RpcRequest {
            seq,
            method: method.to_string(),
            epoch,
            events: rx,
            pending_metadata: options.metadata,
            sent_any: false,
            leading_metadata: None,
            trailing_metadata: None,
            ended: false,
            timer: None,
            _marker: PhantomData,
        };

        match args {
            Some(args) => request.send(args).await?,
            None => {
                if options.send_metadata_first {
                    if let Some(metadata) = request.pending_metadata.take() {
                        let frame = RequestFrame::metadata(seq, method, metadata);
                        request
                            .epoch
                            .send_command(IoCommand::Send(frame))
                            .await?;
                        request.sent_any = true;
                    }
                }
            }
        }

        if let Some(deadline) = options.timeout {
            // Schedule a CANCEL at the deadline; resolved locally by the
            // caller (see call_with) or disarmed when the request ends.
            let timer = CancellationToken::new();
            let guard = timer.clone();
            let epoch = request.epoch.clone();
            let method = request.method.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = guard.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        let _ = epoch
                            .send_command(IoCommand::Send(RequestFrame::cancel(seq, method)))
                            .await;
                    }
                }
            });
            request.timer = Some(timer);
        }

        Ok(request)
    }
}

/// An open request as seen by the client.
///
/// Dropping the handle stops consumption without cancelling the server
/// side; call [`cancel`](Self::cancel) to send CANCEL explicitly.
pub struct RpcRequest<T, R> {
    seq: u64,
    method: String,
    epoch: Arc<Epoch>,
    events: mpsc::UnboundedReceiver<ResponseFrame>,
    pending_metadata: Option<Metadata>,
    sent_any: bool,
    leading_metadata: Option<Metadata>,
    trailing_metadata: Option<Metadata>,
    ended: bool,
    timer: Option<CancellationToken>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> RpcRequest<T, R>
where
    T: Serialize,
    R: DeserializeOwned,
{
    /// Sequence number this request occupies on the connection.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Send one request message. The first send carries any staged
    /// metadata.
    pub async fn send(&mut self, item: &T) -> Result<()> {
        if self.ended {
            return Err(SwillError::Protocol("request already ended".to_string()));
        }
        let value = MsgPackCodec::to_value(item)?;
        let mut frame = RequestFrame::message(self.seq, self.method.clone(), value);
        if let Some(metadata) = self.pending_metadata.take() {
            frame = frame.with_metadata(metadata);
        }
        self.sent_any = true;
        self.epoch.send_command(IoCommand::Send(frame)).await
    }

    /// Stage leading metadata for the next outgoing frame.
    ///
    /// Errors locally once the opening frame is on the wire; leading
    /// metadata can only be sent once.
    pub fn set_metadata(&mut self, metadata: Metadata) -> Result<()> {
        if self.sent_any {
            return Err(SwillError::Protocol(
                "leading metadata has already been sent for this request".to_string(),
            ));
        }
        self.pending_metadata = Some(metadata);
        Ok(())
    }

    /// Wait for the next event. Standalone METADATA frames are folded into
    /// [`leading_metadata`](Self::leading_metadata) and not surfaced.
    pub async fn receive(&mut self) -> Result<RpcEvent<R>> {
        if self.ended {
            return Ok(RpcEvent::EndOfStream);
        }
        loop {
            let ResponseFrame {
                data,
                kind,
                leading_metadata,
                trailing_metadata,
                ..
            } = match self.events.recv().await {
                Some(frame) => frame,
                None => return Err(SwillError::ConnectionClosed),
            };

            if let Some(metadata) = leading_metadata {
                self.leading_metadata
                    .get_or_insert_with(Metadata::new)
                    .extend(metadata);
            }

            match kind {
                ResponseKind::Metadata => continue,
                ResponseKind::Message => {
                    // Trailing metadata only rides terminal frames; a
                    // MESSAGE carrying it is a unary response's single
                    // terminal, with no END_OF_STREAM behind it.
                    if trailing_metadata.is_some() {
                        self.trailing_metadata = trailing_metadata;
                        self.finish();
                    }
                    let value = MsgPackCodec::from_value(data)?;
                    return Ok(RpcEvent::Message(value));
                }
                ResponseKind::EndOfStream => {
                    self.trailing_metadata = trailing_metadata;
                    self.finish();
                    return Ok(RpcEvent::EndOfStream);
                }
                ResponseKind::Error => {
                    self.trailing_metadata = trailing_metadata;
                    self.finish();
                    let error = MsgPackCodec::from_value(data).unwrap_or_else(|_| {
                        ErrorMessage::reserved(
                            ErrorCode::InternalError,
                            "undecodable error payload",
                        )
                    });
                    return Ok(RpcEvent::Error(error));
                }
            }
        }
    }

    /// Signal end of the request stream (client half-close).
    pub async fn end_stream(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let mut frame = RequestFrame::end_of_stream(self.seq, self.method.clone());
        if let Some(metadata) = self.pending_metadata.take() {
            frame = frame.with_metadata(metadata);
        }
        self.sent_any = true;
        self.epoch.send_command(IoCommand::Send(frame)).await
    }

    /// Send CANCEL and stop the request.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let frame = RequestFrame::cancel(self.seq, self.method.clone());
        let result = self.epoch.send_command(IoCommand::Send(frame)).await;
        self.finish();
        result
    }

    /// Stop consuming responses. Does NOT send CANCEL; the server may keep
    /// producing until it terminates on its own.
    pub fn close(&mut self) {
        self.events.close();
        self.finish();
    }

    /// Whether a response is buffered and `receive` would not block.
    pub fn has_data(&self) -> bool {
        !self.events.is_empty()
    }

    /// Whether the request has terminated.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Leading metadata received from the server, if any yet.
    pub fn leading_metadata(&self) -> Option<&Metadata> {
        self.leading_metadata.as_ref()
    }

    /// Trailing metadata from the terminal frame, once ended.
    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.trailing_metadata.as_ref()
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.epoch.try_deregister(self.seq);
            if let Some(timer) = self.timer.take() {
                timer.cancel();
            }
        }
    }
}

impl<T, R> Drop for RpcRequest<T, R> {
    fn drop(&mut self) {
        if !self.ended {
            self.epoch.try_deregister(self.seq);
            if let Some(timer) = self.timer.take() {
                timer.cancel();
            }
        }
    }
}

/// Watch the io task; reconnect per policy when it dies reconnectable.
async fn supervise(inner: Arc<ClientInner>, mut task: JoinHandle<DisconnectKind>) {
    loop {
        let kind = task.await.unwrap_or(DisconnectKind::Reconnectable);
        inner.install_epoch(None);

        if kind == DisconnectKind::Clean {
            tracing::debug!("client disconnected cleanly");
            inner.set_status(ClientStatus::Disconnected);
            return;
        }

        inner.set_status(ClientStatus::Reconnecting);
        let policy = inner.config.reconnect.clone();
        let mut attempts = 0u32;
        let mut reconnected = None;

        while attempts < policy.retries {
            attempts += 1;
            let delay = policy.delay_for(attempts, policy.sample_jitter());
            tracing::info!(attempts, ?delay, "scheduling reconnect");
            tokio::time::sleep(delay).await;

            match inner.connect_epoch().await {
                Ok((epoch, new_task)) => {
                    inner.install_epoch(Some(epoch));
                    inner.set_status(ClientStatus::Connected);
                    tracing::info!(attempts, "reconnected");
                    reconnected = Some(new_task);
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempts, error = %e, "reconnect attempt failed");
                }
            }
        }

        match reconnected {
            Some(new_task) => task = new_task,
            None => {
                tracing::warn!(retries = policy.retries, "reconnect attempts exhausted");
                inner.set_status(ClientStatus::Disconnected);
                return;
            }
        }
    }
}

/// Whether a received close frame leaves the client eligible for
/// reconnection.
fn reconnectable_close(frame: Option<&CloseFrame>) -> bool {
    match frame {
        // Close without a frame is a clean local-style shutdown.
        None => false,
        Some(frame) => frame.code != CloseCode::Normal,
    }
}

/// Own the WebSocket: write commands out, route responses in by sequence.
async fn io_task(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::Receiver<IoCommand>,
) -> DisconnectKind {
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<u64, mpsc::UnboundedSender<ResponseFrame>> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(IoCommand::Register { seq, tx }) => {
                    pending.insert(seq, tx);
                }
                Some(IoCommand::Deregister { seq }) => {
                    pending.remove(&seq);
                }
                Some(IoCommand::Send(frame)) => {
                    let bytes = match encode_request(&frame) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(seq = frame.seq, error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        return DisconnectKind::Reconnectable;
                    }
                }
                Some(IoCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return DisconnectKind::Clean;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => match decode_response(&data) {
                    Ok(frame) => {
                        if let Some(tx) = pending.get(&frame.seq) {
                            // A dead receiver means the request handle was
                            // closed; drop the frame.
                            let _ = tx.send(frame);
                        } else {
                            tracing::debug!(seq = frame.seq, "response for unknown sequence");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(reason = %e.reason, "dropping undecodable response frame");
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return DisconnectKind::Reconnectable;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    tracing::debug!(code, "server closed connection");
                    return if reconnectable_close(frame.as_ref()) {
                        DisconnectKind::Reconnectable
                    } else {
                        DisconnectKind::Clean
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "transport error");
                    return DisconnectKind::Reconnectable;
                }
                None => {
                    // Stream ended without a close frame: abnormal closure.
                    return DisconnectKind::Reconnectable;
                }
            },
        }
    }
}
