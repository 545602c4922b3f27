//! # swill
//!
//! Bidirectional RPC over WebSocket with a compact, self-describing binary
//! wire format (MessagePack).
//!
//! Both endpoints speak the same framing: every WebSocket binary message is
//! one envelope, requests are demultiplexed per connection by sequence
//! number, and each request runs one of four call shapes — unary→unary,
//! stream→unary, unary→stream, or bidi. A per-request state machine
//! enforces frame ordering (metadata, data, end-of-stream, cancel), and the
//! client side carries a reconnect scheduler with capped, jittered backoff.
//!
//! ## Architecture
//!
//! - **Server**: registry + hooks + config, dependency-injected; one
//!   dispatcher task per connection demuxes inbound frames into requests
//!   and muxes handler output into the transport.
//! - **Handlers**: registered through four typed surfaces; the call shape
//!   is classified once, at registration.
//! - **Client**: `call` for unary calls, `rpc` for streaming; a supervisor
//!   reconnects on non-clean closes.
//!
//! ## Example
//!
//! ```ignore
//! use swill::{Client, Request, Server};
//!
//! #[tokio::main]
//! async fn main() -> swill::Result<()> {
//!     let mut server = Server::new();
//!     server.unary("add", |request: Request<(i64, i64)>, _ctx| async move {
//!         let (a, b) = request.into_data();
//!         Ok(a + b)
//!     })?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:4700").await?;
//!     tokio::spawn(server.serve(listener));
//!
//!     let client = Client::connect("ws://127.0.0.1:4700").await?;
//!     let sum: Option<i64> = client.call("add", &(1i64, 2i64)).await?;
//!     assert_eq!(sum, Some(3));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod protocol;
pub mod server;
pub mod stream;

mod dispatch;

pub use client::{
    CallOptions, Client, ClientConfig, ClientStatus, ReconnectPolicy, RpcEvent, RpcRequest,
};
pub use config::Config;
pub use connection::{ConnectionInfo, SUBPROTOCOL};
pub use error::{Result, SwillError};
pub use handler::{Context, HandlerRegistry, Request, RequestInfo, Responder, RpcInfo};
pub use hooks::{HookArgs, HookPayload, HookPoint};
pub use protocol::{ErrorCode, ErrorMessage, Metadata, RpcShape};
pub use server::Server;
pub use stream::StreamReader;
