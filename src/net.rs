//! Raw (not yet multiplexed) network connections and listeners.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A raw bidirectional byte stream a transport can multiplex.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawIo for T {}

pub type BoxedIo = Box<dyn RawIo>;

static NEXT_NET_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`NetConn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetConnId(u64);

impl fmt::Display for NetConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

/// Handle to one raw network connection.
///
/// Clones share the same identity, which is what
/// [`Swarm::add_conn`](crate::Swarm::add_conn) keys idempotent registration
/// on. The byte stream itself is handed to a transport exactly once.
#[derive(Clone)]
pub struct NetConn {
    inner: Arc<NetConnInner>,
}

struct NetConnInner {
    id: NetConnId,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    io: Mutex<Option<BoxedIo>>,
}

impl NetConn {
    /// Wrap any byte stream (an in-memory duplex pipe, a TLS stream, ...).
    pub fn new<T: RawIo>(io: T) -> Self {
        Self::with_addrs(io, None, None)
    }

    pub fn with_addrs<T: RawIo>(
        io: T,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(NetConnInner {
                id: NetConnId(NEXT_NET_CONN_ID.fetch_add(1, Ordering::Relaxed)),
                local_addr,
                peer_addr,
                io: Mutex::new(Some(Box::new(io))),
            }),
        }
    }

    /// Wrap a TCP stream, recording both socket addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        Self::with_addrs(stream, local_addr, peer_addr)
    }

    pub fn id(&self) -> NetConnId {
        self.inner.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Take the byte stream out. Only the first call succeeds.
    pub fn take_io(&self) -> io::Result<BoxedIo> {
        self.inner.io.lock().take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is already owned by a session", self.inner.id),
            )
        })
    }

    /// Whether a transport has already taken the byte stream.
    pub fn is_taken(&self) -> bool {
        self.inner.io.lock().is_none()
    }
}

impl PartialEq for NetConn {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NetConn {}

impl fmt::Debug for NetConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetConn")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

/// Source of raw inbound connections.
#[async_trait]
pub trait NetListener: Send + Sync + 'static {
    /// Wait for the next inbound connection. An error ends the accept loop.
    async fn accept(&self) -> io::Result<NetConn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl NetListener for TcpListener {
    async fn accept(&self) -> io::Result<NetConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(NetConn::from_tcp(stream))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_io_once() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = NetConn::new(a);
        assert!(!conn.is_taken());

        let clone = conn.clone();
        assert!(clone.take_io().is_ok());
        assert!(conn.is_taken());

        let err = conn.take_io().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_identity() {
        let (a, b) = tokio::io::duplex(64);
        let conn_a = NetConn::new(a);
        let conn_b = NetConn::new(b);

        assert_eq!(conn_a, conn_a.clone());
        assert_ne!(conn_a, conn_b);
        assert_ne!(conn_a.id(), conn_b.id());
        assert!(conn_a.peer_addr().is_none());
    }

    #[tokio::test]
    async fn test_tcp_listener_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NetListener::local_addr(&listener).unwrap();

        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let accepted = NetListener::accept(&listener).await.unwrap();
        let dialed = dial.await.unwrap();

        assert_eq!(accepted.local_addr(), Some(addr));
        assert_eq!(accepted.peer_addr(), dialed.local_addr().ok());
    }
}
