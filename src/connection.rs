//! Connection management.
//!
//! A [`ConnectionInfo`] is created at transport accept and lives for the
//! lifetime of the WebSocket. It captures the upgrade request (headers,
//! path, remote address) as opaque metadata and carries a user-scoped
//! key/value bag that hooks and handlers share.
//!
//! The handshake negotiates the `swill/1` subprotocol; clients that do not
//! offer it are rejected before the upgrade completes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rmpv::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{Result, SwillError};
use crate::protocol::Metadata;

/// The WebSocket subprotocol both endpoints must speak.
pub const SUBPROTOCOL: &str = "swill/1";

/// Connection-scoped state shared with hooks and handlers.
///
/// The metadata map holds the upgrade request as opaque key/value pairs
/// (header name → value, plus `:path`). The bag is free for application
/// use.
pub struct ConnectionInfo {
    id: String,
    remote_addr: SocketAddr,
    metadata: Mutex<Metadata>,
    bag: Mutex<BTreeMap<String, Value>>,
}

impl ConnectionInfo {
    pub(crate) fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            remote_addr,
            metadata: Mutex::new(Metadata::new()),
            bag: Mutex::new(BTreeMap::new()),
        }
    }

    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer address captured at accept time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Snapshot of the connection metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_metadata(&self, metadata: Metadata) {
        *self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = metadata;
    }

    /// Read a value from the user-scoped bag.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store a value in the user-scoped bag, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.bag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
    }

    /// Remove a value from the user-scoped bag.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.bag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Accept the WebSocket upgrade on an inbound TCP stream.
///
/// Negotiates the `swill/1` subprotocol and captures the upgrade request's
/// headers and path as connection metadata. Clients that do not offer the
/// subprotocol are rejected with `400 Bad Request`.
pub(crate) async fn accept_websocket(
    stream: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, Metadata)> {
    let captured = std::sync::Arc::new(Mutex::new(Metadata::new()));
    let captured_in_callback = captured.clone();

    let callback = move |request: &Request, mut response: Response| {
        let mut metadata = Metadata::new();
        metadata.insert(
            ":path".to_string(),
            Value::from(request.uri().path()),
        );
        for (name, value) in request.headers() {
            metadata.insert(
                name.as_str().to_string(),
                Value::from(value.to_str().unwrap_or_default()),
            );
        }
        *captured_in_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = metadata;

        if !offers_subprotocol(request) {
            let mut rejection = ErrorResponse::new(Some("no suitable subprotocol".to_string()));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            return Err(rejection);
        }

        response
            .headers_mut()
            .append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| SwillError::Handshake(e.to_string()))?;

    let metadata = captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Ok((ws, metadata))
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offer| offer.trim() == SUBPROTOCOL)
}

/// Connect to a swill server, offering the `swill/1` subprotocol.
///
/// The attempt is bounded by `timeout`; on expiry the caller's reconnect
/// scheduler takes over.
pub(crate) async fn connect_websocket(
    url: &str,
    timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SwillError::Handshake(e.to_string()))?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (ws, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| SwillError::ConnectTimeout)?
        .map_err(|e| SwillError::Handshake(e.to_string()))?;

    let negotiated = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    if negotiated != Some(SUBPROTOCOL) {
        return Err(SwillError::Handshake(format!(
            "server did not accept subprotocol {SUBPROTOCOL}"
        )));
    }

    Ok(ws)
}

/// Normalize a close code raised from a hook.
///
/// Codes below 1000 are only meaningful as HTTP statuses; once the
/// handshake has completed they are coerced to a normal closure.
pub(crate) fn normalize_close_code(code: u16) -> u16 {
    if code < 1000 {
        1000
    } else {
        code
    }
}
