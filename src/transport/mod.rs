//! Capability boundary to a concrete stream-multiplexing wire protocol.
//!
//! A [`Transport`] turns a raw [`NetConn`] into a [`Session`] that can open
//! and accept logical streams. Nothing above this module knows how
//! streams are framed on the wire, so a new protocol plugs in by
//! implementing these two traits.
//!
//! Errors returned by implementations are propagated to callers unchanged;
//! nothing at this layer retries.

pub mod mplex;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::net::NetConn;

/// A logical stream produced by a [`Session`].
///
/// Closing a stream means `shutdown()` followed by dropping it.
pub trait MuxedStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> MuxedStream for T {}

pub type BoxedStream = Box<dyn MuxedStream>;

/// Callback a session invokes once per inbound stream.
///
/// The returned future is awaited before the next inbound stream is
/// dispatched, so inbound streams on one session are handled strictly in
/// arrival order.
pub type InboundHandler = Box<dyn FnMut(BoxedStream) -> BoxFuture<'static, ()> + Send>;

/// Factory for multiplexing sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start a session over `conn`, taking ownership of its byte stream.
    ///
    /// `is_server` tells protocols with asymmetric roles which side this is.
    async fn new_conn(&self, conn: &NetConn, is_server: bool) -> Result<Arc<dyn Session>>;
}

/// One multiplexing session over one raw connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<BoxedStream>;

    /// Dispatch inbound streams to `handler` until the session ends.
    async fn serve(&self, handler: InboundHandler);

    /// End the session. Blocked `serve`, reads and writes return promptly.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
