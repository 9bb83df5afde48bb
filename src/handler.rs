//! Swappable behaviour: inbound stream handlers and connection selectors.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::stream::Stream;

type HandlerFn = dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync;
type SelectFn = dyn Fn(&[Connection]) -> Option<Connection> + Send + Sync;

/// Receives streams opened by remote peers.
///
/// Handlers on one connection run one at a time: the next inbound stream is
/// not dispatched until the returned future completes. A handler that does
/// long-lived work should spawn it (see [`StreamHandler::echo`]).
///
/// The handler owns the stream and is responsible for closing it; keeping
/// it open past the end of the handler is fine.
#[derive(Clone)]
pub struct StreamHandler(Arc<HandlerFn>);

impl StreamHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |stream| f(stream).boxed()))
    }

    /// Close every inbound stream immediately.
    pub fn close() -> Self {
        Self::new(|stream: Stream| async move {
            if let Err(e) = stream.close().await {
                trace!("Closing inbound stream {} failed: {}", stream.id(), e);
            }
        })
    }

    /// Echo everything back on a spawned task, then close.
    pub fn echo() -> Self {
        Self::new(|stream: Stream| async move {
            tokio::spawn(async move {
                let mut reader = stream.clone();
                let mut writer = stream.clone();
                match tokio::io::copy(&mut reader, &mut writer).await {
                    Ok(n) => trace!("Echoed {} bytes on stream {}", n, stream.id()),
                    Err(e) => debug!("Echo on stream {} failed: {}", stream.id(), e),
                }
                let _ = stream.close().await;
            });
        })
    }

    pub async fn call(&self, stream: Stream) {
        (self.0)(stream).await
    }
}

impl Default for StreamHandler {
    fn default() -> Self {
        Self::close()
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamHandler(..)")
    }
}

/// Picks one connection out of a candidate slice.
///
/// A selector must return one of the candidates it was given, or `None`.
/// Anything else makes the stream-opening call fail with
/// [`Error::InvalidConnSelected`](crate::Error::InvalidConnSelected).
#[derive(Clone)]
pub struct SelectConn(Arc<SelectFn>);

impl SelectConn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Connection]) -> Option<Connection> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Uniformly random choice.
    pub fn random() -> Self {
        Self::new(|conns| conns.choose(&mut rand::thread_rng()).cloned())
    }

    /// Cycle through the candidates, one per call.
    pub fn round_robin() -> Self {
        let next = AtomicUsize::new(0);
        Self::new(move |conns| {
            if conns.is_empty() {
                return None;
            }
            let i = next.fetch_add(1, Ordering::Relaxed);
            Some(conns[i % conns.len()].clone())
        })
    }

    pub fn select(&self, conns: &[Connection]) -> Option<Connection> {
        (self.0)(conns)
    }
}

impl Default for SelectConn {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Debug for SelectConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SelectConn(..)")
    }
}
