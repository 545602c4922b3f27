//! Handler module - registration, classification, and request contexts.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to handlers; classifies the
//!   call shape at registration
//! - [`Context`] - connection state, metadata, and cancellation for a
//!   running handler
//! - [`Request`] / [`Responder`] - the typed inbound and outbound surfaces
//!
//! # Example
//!
//! ```ignore
//! let mut server = Server::new();
//!
//! server.unary("add", |request: Request<(i64, i64)>, _ctx| async move {
//!     let (a, b) = request.into_data();
//!     Ok(a + b)
//! })?;
//!
//! server.duplex("pump", |mut input: StreamReader<i64>, out, ctx| async move {
//!     while let Some(n) = input.next().await? {
//!         out.send(&(n * 2)).await?;
//!     }
//!     Ok(())
//! })?;
//! ```

mod context;
mod registry;

pub use context::{Context, Request, RequestInfo, Responder};
pub use registry::{BoxFuture, HandlerRegistry, RpcInfo};

pub(crate) use context::{error_payload, ResponseChannel};
pub(crate) use registry::InboundPayload;
