//! The swill server.
//!
//! A [`Server`] is an explicit bundle of handler registry, lifecycle hooks,
//! and configuration; no process-wide state is involved. Register handlers
//! and hooks, then hand it a [`TcpListener`]:
//!
//! ```ignore
//! let mut server = Server::new();
//!
//! server.unary("add", |request: Request<(i64, i64)>, _ctx| async move {
//!     let (a, b) = request.into_data();
//!     Ok(a + b)
//! })?;
//!
//! server.on(HookPoint::BeforeRequest, |args| async move {
//!     tracing::debug!("request starting");
//!     Ok(())
//! });
//!
//! let listener = TcpListener::bind("127.0.0.1:4700").await?;
//! server.serve(listener).await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::config::Config;
use crate::connection::{accept_websocket, normalize_close_code, ConnectionInfo};
use crate::dispatch::Dispatcher;
use crate::error::{Result, SwillError};
use crate::handler::{Context, HandlerRegistry, Request, Responder, RpcInfo};
use crate::hooks::{HookArgs, HookPoint, LifecycleHooks};
use crate::stream::StreamReader;

/// A swill RPC server.
pub struct Server {
    registry: HandlerRegistry,
    hooks: LifecycleHooks,
    config: Config,
}

impl Server {
    /// Create a server with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a server with explicit configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            hooks: LifecycleHooks::new(),
            config,
        }
    }

    /// Register a unary→unary handler.
    pub fn unary<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Request<T>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.registry.unary(name, handler)
    }

    /// Register a client-stream→unary handler.
    pub fn client_streaming<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(StreamReader<T>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.registry.client_streaming(name, handler)
    }

    /// Register a unary→server-stream handler.
    pub fn server_streaming<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Request<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.server_streaming(name, handler)
    }

    /// Register a bidi handler.
    pub fn duplex<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(StreamReader<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.duplex(name, handler)
    }

    /// Register a lifecycle hook callback. Callbacks at one point run in
    /// registration order.
    pub fn on<F, Fut>(&mut self, point: HookPoint, callback: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.on(point, callback);
    }

    /// Accept connections on `listener` until it fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shared = Arc::new(self.into_shared()?);
        tracing::info!(addr = ?listener.local_addr().ok(), "swill server listening");

        loop {
            let (stream, addr) = listener.accept().await?;
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.handle_connection(stream, addr).await;
            });
        }
    }

    fn into_shared(mut self) -> Result<SharedServer> {
        if self.config.introspection {
            register_introspection(&mut self.registry)?;
        }
        Ok(SharedServer {
            registry: Arc::new(self.registry),
            hooks: Arc::new(self.hooks),
            config: Arc::new(self.config),
        })
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen server state shared by every connection task.
struct SharedServer {
    registry: Arc<HandlerRegistry>,
    hooks: Arc<LifecycleHooks>,
    config: Arc<Config>,
}

impl SharedServer {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let connection = Arc::new(ConnectionInfo::new(addr));
        tracing::debug!(connection = %connection.id(), %addr, "transport accepted");

        // A before_connection abort rejects the transport before the
        // upgrade completes.
        if let Err(e) = self
            .hooks
            .run(
                HookPoint::BeforeConnection,
                HookArgs::for_connection(connection.clone()),
            )
            .await
        {
            tracing::debug!(connection = %connection.id(), error = %e, "connection rejected");
            return;
        }

        let (ws, metadata) = match accept_websocket(stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(connection = %connection.id(), error = %e, "handshake failed");
                return;
            }
        };
        connection.set_metadata(metadata);

        if let Err(e) = self
            .hooks
            .run(
                HookPoint::BeforeAccept,
                HookArgs::for_connection(connection.clone()),
            )
            .await
        {
            let (code, reason) = match e {
                SwillError::CloseConnection { code, reason } => (code, reason),
                other => (1008, other.to_string()),
            };
            tracing::debug!(connection = %connection.id(), code, "connection closed by before_accept");
            let mut ws = ws;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(normalize_close_code(code)),
                    reason: reason.into(),
                }))
                .await;
            return;
        }

        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.hooks.clone(),
            self.config.clone(),
            connection.clone(),
        );
        if let Err(e) = dispatcher.run(ws).await {
            tracing::warn!(connection = %connection.id(), error = %e, "connection ended with error");
        } else {
            tracing::debug!(connection = %connection.id(), "connection closed");
        }
    }
}

/// Register the `swill.introspect` procedure: a server-stream of one
/// [`RpcInfo`] record per registered method.
fn register_introspection(registry: &mut HandlerRegistry) -> Result<()> {
    let infos = registry.describe();
    registry.server_streaming(
        "swill.introspect",
        move |_request: Request<Value>, out: Responder<RpcInfo>, _ctx: Context| {
            let infos = infos.clone();
            async move {
                for info in &infos {
                    out.send(info).await?;
                }
                Ok(())
            }
        },
    )
}
