//! Handler registry and call-shape classifier.
//!
//! Methods are registered through four typed surfaces, one per call shape;
//! the shape is classified once, at registration, from which surface was
//! used. The registry erases the concrete payload types behind
//! [`RpcHandler`], so the dispatcher only ever moves dynamic values.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//!
//! registry.unary("add", |request: Request<(i64, i64)>, _ctx| async move {
//!     let (a, b) = request.into_data();
//!     Ok(a + b)
//! })?;
//!
//! registry.server_streaming("count", |request: Request<u64>, out, _ctx| async move {
//!     for i in 0..request.into_data() {
//!         out.send(&i).await?;
//!     }
//!     Ok(())
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::context::{Context, Request, Responder, ResponseChannel};
use crate::codec::MsgPackCodec;
use crate::error::{Result, SwillError};
use crate::protocol::{ErrorCode, ErrorMessage, RpcShape};
use crate::stream::StreamReader;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The inbound side of a request, as handed to a handler.
pub(crate) enum InboundPayload {
    /// The single request message of a unary-request shape.
    Unary(Value),
    /// The inbound queue of a streaming-request shape.
    Stream(mpsc::Receiver<Value>),
}

/// Type-erased handler callable.
pub(crate) trait RpcHandler: Send + Sync + 'static {
    /// Run the handler for one request. The returned future resolves once
    /// the handler body has finished and its terminal frame is enqueued;
    /// an error means the dispatcher should answer with an ERROR frame.
    fn call(
        &self,
        inbound: InboundPayload,
        channel: Arc<ResponseChannel>,
    ) -> BoxFuture<'static, Result<()>>;
}

fn invalid_payload(e: SwillError) -> SwillError {
    SwillError::Rpc(ErrorMessage::reserved(
        ErrorCode::InvalidArgument,
        format!("invalid request payload: {e}"),
    ))
}

fn shape_mismatch() -> BoxFuture<'static, Result<()>> {
    Box::pin(async {
        Err(SwillError::Protocol(
            "inbound payload does not match the registered call shape".to_string(),
        ))
    })
}

/// Unary→unary wrapper: decode one message, send one terminal message.
struct UnaryRpc<F, T, R, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> RpcHandler for UnaryRpc<F, T, R, Fut>
where
    F: Fn(Request<T>, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(
        &self,
        inbound: InboundPayload,
        channel: Arc<ResponseChannel>,
    ) -> BoxFuture<'static, Result<()>> {
        let InboundPayload::Unary(value) = inbound else {
            return shape_mismatch();
        };
        let data: T = match MsgPackCodec::from_value(value) {
            Ok(data) => data,
            Err(e) => return Box::pin(async move { Err(invalid_payload(e)) }),
        };

        let request = Request::new(data, channel.request());
        let fut = (self.f)(request, Context::new(channel.clone()));
        Box::pin(async move {
            let result = fut.await?;
            let value = MsgPackCodec::to_value(&result)?;
            channel.send_unary(value).await
        })
    }
}

/// Client-stream→unary wrapper: drain the stream, send one terminal
/// message.
struct ClientStreamRpc<F, T, R, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> RpcHandler for ClientStreamRpc<F, T, R, Fut>
where
    F: Fn(StreamReader<T>, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(
        &self,
        inbound: InboundPayload,
        channel: Arc<ResponseChannel>,
    ) -> BoxFuture<'static, Result<()>> {
        let InboundPayload::Stream(rx) = inbound else {
            return shape_mismatch();
        };
        let reader = StreamReader::new(rx, channel.cancel_token());

        let fut = (self.f)(reader, Context::new(channel.clone()));
        Box::pin(async move {
            let result = fut.await?;
            let value = MsgPackCodec::to_value(&result)?;
            channel.send_unary(value).await
        })
    }
}

/// Unary→server-stream wrapper: END_OF_STREAM goes out automatically when
/// the handler completes.
struct ServerStreamRpc<F, T, R, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> RpcHandler for ServerStreamRpc<F, T, R, Fut>
where
    F: Fn(Request<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(
        &self,
        inbound: InboundPayload,
        channel: Arc<ResponseChannel>,
    ) -> BoxFuture<'static, Result<()>> {
        let InboundPayload::Unary(value) = inbound else {
            return shape_mismatch();
        };
        let data: T = match MsgPackCodec::from_value(value) {
            Ok(data) => data,
            Err(e) => return Box::pin(async move { Err(invalid_payload(e)) }),
        };

        let request = Request::new(data, channel.request());
        let fut = (self.f)(
            request,
            Responder::new(channel.clone()),
            Context::new(channel.clone()),
        );
        Box::pin(async move {
            fut.await?;
            channel.send_end().await
        })
    }
}

/// Bidi wrapper: stream in, stream out.
struct DuplexRpc<F, T, R, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> RpcHandler for DuplexRpc<F, T, R, Fut>
where
    F: Fn(StreamReader<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(
        &self,
        inbound: InboundPayload,
        channel: Arc<ResponseChannel>,
    ) -> BoxFuture<'static, Result<()>> {
        let InboundPayload::Stream(rx) = inbound else {
            return shape_mismatch();
        };
        let reader = StreamReader::new(rx, channel.cancel_token());

        let fut = (self.f)(
            reader,
            Responder::new(channel.clone()),
            Context::new(channel.clone()),
        );
        Box::pin(async move {
            fut.await?;
            channel.send_end().await
        })
    }
}

/// Entry for a registered method.
pub(crate) struct MethodEntry {
    pub(crate) handler: Box<dyn RpcHandler>,
    pub(crate) shape: RpcShape,
}

/// Description of one registered method, as served by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcInfo {
    /// Method name.
    pub name: String,
    /// Whether the client sends a stream of messages.
    pub request_streams: bool,
    /// Whether the server sends a stream of messages.
    pub response_streams: bool,
}

/// Registry mapping method names to handlers.
///
/// Classification happens here, once: the registration surface used
/// determines the call shape stored in the entry.
pub struct HandlerRegistry {
    methods: HashMap<String, MethodEntry>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
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
        self.insert(
            name,
            RpcShape::Unary,
            Box::new(UnaryRpc {
                f: handler,
                _marker: PhantomData,
            }),
        )
    }

    /// Register a client-stream→unary handler.
    pub fn client_streaming<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(StreamReader<T>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.insert(
            name,
            RpcShape::ClientStream,
            Box::new(ClientStreamRpc {
                f: handler,
                _marker: PhantomData,
            }),
        )
    }

    /// Register a unary→server-stream handler.
    pub fn server_streaming<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Request<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(
            name,
            RpcShape::ServerStream,
            Box::new(ServerStreamRpc {
                f: handler,
                _marker: PhantomData,
            }),
        )
    }

    /// Register a bidi handler.
    pub fn duplex<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(StreamReader<T>, Responder<R>, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(
            name,
            RpcShape::Duplex,
            Box::new(DuplexRpc {
                f: handler,
                _marker: PhantomData,
            }),
        )
    }

    fn insert(&mut self, name: &str, shape: RpcShape, handler: Box<dyn RpcHandler>) -> Result<()> {
        if self.methods.contains_key(name) {
            return Err(SwillError::Config(format!(
                "method {name:?} is already registered"
            )));
        }
        self.methods
            .insert(name.to_string(), MethodEntry { handler, shape });
        Ok(())
    }

    /// Look up a method entry.
    pub(crate) fn get(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    /// The call shape a method was registered with.
    pub fn shape_of(&self, name: &str) -> Option<RpcShape> {
        self.methods.get(name).map(|entry| entry.shape)
    }

    /// Whether a method is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Describe the registered methods, sorted by name. Methods under the
    /// `swill.` prefix are internal and skipped.
    pub fn describe(&self) -> Vec<RpcInfo> {
        let mut infos: Vec<RpcInfo> = self
            .methods
            .iter()
            .filter(|(name, _)| !name.starts_with("swill."))
            .map(|(name, entry)| RpcInfo {
                name: name.clone(),
                request_streams: entry.shape.client_streams(),
                response_streams: entry.shape.server_streams(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_classifies_shapes() {
        let mut registry = HandlerRegistry::new();

        registry
            .unary("add", |request: Request<(i64, i64)>, _ctx| async move {
                let (a, b) = request.into_data();
                Ok(a + b)
            })
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
            .duplex(
                "echo",
                |mut input: StreamReader<String>, out: Responder<String>, _ctx| async move {
                    while let Some(item) = input.next().await? {
                        out.send(&item).await?;
                    }
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(registry.shape_of("add"), Some(RpcShape::Unary));
        assert_eq!(registry.shape_of("sum"), Some(RpcShape::ClientStream));
        assert_eq!(registry.shape_of("count"), Some(RpcShape::ServerStream));
        assert_eq!(registry.shape_of("echo"), Some(RpcShape::Duplex));
        assert!(registry.shape_of("missing").is_none());
    }

    #[test]
    fn test_name_collision_is_config_error() {
        let mut registry = HandlerRegistry::new();

        registry
            .unary("echo", |request: Request<String>, _ctx| async move {
                Ok(request.into_data())
            })
            .unwrap();

        let result = registry.client_streaming("echo", |mut input: StreamReader<String>, _ctx| {
            async move {
                let first = input.next().await?;
                Ok(first.unwrap_or_default())
            }
        });
        assert!(matches!(result, Err(SwillError::Config(_))));
    }

    #[test]
    fn test_describe_skips_internal_methods() {
        let mut registry = HandlerRegistry::new();
        registry
            .unary("b", |request: Request<i64>, _ctx| async move {
                Ok(request.into_data())
            })
            .unwrap();
        registry
            .unary("a", |request: Request<i64>, _ctx| async move {
                Ok(request.into_data())
            })
            .unwrap();
        registry
            .server_streaming(
                "swill.introspect",
                |_request: Request<Value>, _out: Responder<RpcInfo>, _ctx| async move { Ok(()) },
            )
            .unwrap();

        let infos = registry.describe();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "a");
        assert_eq!(infos[1].name, "b");
        assert!(!infos[0].request_streams);
        assert!(!infos[0].response_streams);
    }
}
