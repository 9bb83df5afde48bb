use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tracing::trace;

use crate::connection::{ConnInner, Connection};
use crate::error::Result;
use crate::group::{GroupSet, Groupable};
use crate::swarm::Swarm;
use crate::transport::BoxedStream;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Swarm-unique identity of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// One logical bidirectional channel multiplexed over a [`Connection`].
///
/// Implements `AsyncRead + AsyncWrite`, passing straight through to the
/// transport stream with no buffering of its own. The handle is `Clone`
/// and clones share the underlying stream, so one clone can read while
/// another writes.
///
/// Closing always goes through the owning swarm, so a closed stream is
/// gone from both the swarm's and the connection's stream sets no matter
/// which handle closed it.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: StreamId,

    /// Owning connection (non-owning back-reference)
    conn: Weak<ConnInner>,

    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,

    groups: GroupSet,
}

impl Stream {
    /// Wrap a transport stream. Groups start as a snapshot of the
    /// connection's groups.
    pub(crate) fn new(raw: BoxedStream, conn: &Connection) -> Self {
        let (reader, writer) = tokio::io::split(raw);
        Self {
            inner: Arc::new(StreamInner {
                id: StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)),
                conn: conn.downgrade(),
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                groups: conn.group_set().clone(),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// The connection carrying this stream, while it is alive.
    pub fn conn(&self) -> Option<Connection> {
        self.inner.conn.upgrade().map(Connection::from_inner)
    }

    /// The swarm this stream belongs to, while it is alive.
    pub fn swarm(&self) -> Option<Swarm> {
        self.conn().and_then(|conn| conn.swarm())
    }

    /// Whether the transport stream has been released.
    pub fn is_closed(&self) -> bool {
        self.inner.writer.lock().is_none() && self.inner.reader.lock().is_none()
    }

    /// Close the stream.
    ///
    /// Removes it from the swarm and connection, then shuts the transport
    /// stream down. Closing an already closed stream is a no-op.
    pub async fn close(&self) -> Result<()> {
        match self.swarm() {
            Some(swarm) => swarm.remove_stream(self).await,
            None => self.release().await,
        }
    }

    /// Shut down and drop the transport stream.
    pub(crate) async fn release(&self) -> Result<()> {
        let writer = self.inner.writer.lock().take();
        let reader = self.inner.reader.lock().take();

        let result = match writer {
            Some(mut writer) => writer.shutdown().await.map_err(Into::into),
            None => Ok(()),
        };

        if reader.is_some() {
            trace!("Released {}", self.inner.id);
        }
        result
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut reader = self.inner.reader.lock();
        match reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut writer = self.inner.writer.lock();
        match writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = self.inner.writer.lock();
        match writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    /// Half-close the write side. Use [`Stream::close`] to release the stream.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = self.inner.writer.lock();
        match writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Groupable for Stream {
    fn group_set(&self) -> &GroupSet {
        &self.inner.groups
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Stream {}

impl Hash for Stream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("groups", &self.inner.groups)
            .finish()
    }
}
