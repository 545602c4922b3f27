//! Lifecycle hook chain.
//!
//! Eleven named hook points cover the connection and request lifecycle.
//! Callbacks registered for a point run in registration order; an error from
//! one callback prevents the rest of that point from running and aborts the
//! surrounding operation:
//!
//! - `before_connection` / `before_accept` errors reject the transport with
//!   a close code
//! - `before_request*` errors produce an ERROR response and terminate the
//!   request
//! - `before_leading_metadata` / `before_response_message` /
//!   `before_trailing_metadata` errors replace the outbound frame with an
//!   ERROR
//!
//! # Example
//!
//! ```ignore
//! server.on(HookPoint::BeforeRequest, |args: HookArgs| async move {
//!     let request = args.request.as_ref().expect("request-scoped hook");
//!     tracing::debug!(method = %request.method(), "request starting");
//!     Ok(())
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;
use tokio::sync::Mutex;

use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::handler::RequestInfo;
use crate::protocol::Metadata;

/// Boxed future returned by hook callbacks.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

type HookCallback = Box<dyn Fn(HookArgs) -> HookFuture + Send + Sync>;

/// The eleven lifecycle hook points, in invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Transport arrived, before the WebSocket handshake.
    BeforeConnection,
    /// Handshake complete, before the dispatcher starts.
    BeforeAccept,
    /// A new request was created, before its handler launches.
    BeforeRequest,
    /// A standalone metadata frame arrived for a request.
    BeforeRequestMetadata,
    /// A data-bearing frame arrived, before payload decoding.
    BeforeRequestData,
    /// An inbound message is about to be delivered to the handler.
    BeforeRequestMessage,
    /// Leading metadata is about to go out.
    BeforeLeadingMetadata,
    /// An outbound message is about to go out.
    BeforeResponseMessage,
    /// Trailing metadata is about to go out on the terminal frame.
    BeforeTrailingMetadata,
    /// The handler finished and the request is being torn down.
    AfterRequest,
    /// The connection closed.
    AfterConnection,
}

impl HookPoint {
    const COUNT: usize = 11;

    fn index(self) -> usize {
        match self {
            HookPoint::BeforeConnection => 0,
            HookPoint::BeforeAccept => 1,
            HookPoint::BeforeRequest => 2,
            HookPoint::BeforeRequestMetadata => 3,
            HookPoint::BeforeRequestData => 4,
            HookPoint::BeforeRequestMessage => 5,
            HookPoint::BeforeLeadingMetadata => 6,
            HookPoint::BeforeResponseMessage => 7,
            HookPoint::BeforeTrailingMetadata => 8,
            HookPoint::AfterRequest => 9,
            HookPoint::AfterConnection => 10,
        }
    }
}

/// Mutable payload handed to a hook, when the point carries one.
#[derive(Clone)]
pub enum HookPayload {
    /// Connection- and request-scoped points carry no payload.
    None,
    /// A message payload. Mutations are visible to the handler (inbound) or
    /// the wire (outbound).
    Data(Arc<Mutex<Value>>),
    /// A metadata map. Mutations are visible on the wire.
    Metadata(Arc<Mutex<Metadata>>),
}

/// Context handed to every hook callback.
#[derive(Clone)]
pub struct HookArgs {
    /// The connection this event belongs to.
    pub connection: Arc<ConnectionInfo>,
    /// The request, for request-scoped points.
    pub request: Option<Arc<RequestInfo>>,
    /// Point-specific payload.
    pub payload: HookPayload,
}

impl HookArgs {
    pub(crate) fn for_connection(connection: Arc<ConnectionInfo>) -> Self {
        Self {
            connection,
            request: None,
            payload: HookPayload::None,
        }
    }

    pub(crate) fn for_request(request: Arc<RequestInfo>) -> Self {
        Self {
            connection: request.connection(),
            request: Some(request),
            payload: HookPayload::None,
        }
    }

    pub(crate) fn with_data(mut self, data: Arc<Mutex<Value>>) -> Self {
        self.payload = HookPayload::Data(data);
        self
    }

    pub(crate) fn with_metadata(mut self, metadata: Arc<Mutex<Metadata>>) -> Self {
        self.payload = HookPayload::Metadata(metadata);
        self
    }

    /// The message payload cell, for points that carry one.
    pub fn data(&self) -> Option<&Arc<Mutex<Value>>> {
        match &self.payload {
            HookPayload::Data(cell) => Some(cell),
            _ => None,
        }
    }

    /// The metadata cell, for points that carry one.
    pub fn metadata(&self) -> Option<&Arc<Mutex<Metadata>>> {
        match &self.payload {
            HookPayload::Metadata(cell) => Some(cell),
            _ => None,
        }
    }
}

/// Ordered callback chains for every hook point.
pub struct LifecycleHooks {
    chains: [Vec<HookCallback>; HookPoint::COUNT],
}

impl LifecycleHooks {
    /// Create an empty hook registry.
    pub fn new() -> Self {
        Self {
            chains: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Register a callback at a hook point. Callbacks run in registration
    /// order.
    pub fn on<F, Fut>(&mut self, point: HookPoint, callback: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.chains[point.index()]
            .push(Box::new(move |args| Box::pin(callback(args))));
    }

    /// Whether any callbacks are registered at a point.
    pub(crate) fn is_empty(&self, point: HookPoint) -> bool {
        self.chains[point.index()].is_empty()
    }

    /// Run every callback registered at a point, in order. The first error
    /// short-circuits the chain.
    pub(crate) async fn run(&self, point: HookPoint, args: HookArgs) -> Result<()> {
        let chain = &self.chains[point.index()];
        if chain.is_empty() {
            return Ok(());
        }
        tracing::trace!(point = ?point, count = chain.len(), "running lifecycle hooks");
        for callback in chain {
            callback(args.clone()).await?;
        }
        Ok(())
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a payload value in a shared cell for hook mutation.
pub(crate) fn shared_cell<T>(value: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(value))
}

/// Recover the payload out of a shared cell once the hooks have run.
pub(crate) async fn unwrap_cell<T: Clone>(cell: Arc<Mutex<T>>) -> T {
    match Arc::try_unwrap(cell) {
        Ok(mutex) => mutex.into_inner(),
        // A hook held onto the cell; fall back to a copy of its view.
        Err(cell) => cell.lock().await.clone(),
    }
}
