use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::group::{GroupSet, Groupable};
use crate::net::NetConn;
use crate::stream::{Stream, StreamId};
use crate::swarm::{Swarm, SwarmInner};
use crate::transport::{BoxedStream, InboundHandler, Session};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Swarm-unique identity of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A swarm-associated connection: one raw network connection plus the
/// multiplexing session running over it.
///
/// Cheap to clone; clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

pub(crate) struct ConnInner {
    id: ConnId,

    /// Underlying raw connection
    net_conn: NetConn,

    /// Multiplexing session over `net_conn`
    session: Arc<dyn Session>,

    /// Owning swarm (non-owning back-reference)
    swarm: Weak<SwarmInner>,

    /// Active streams on this connection
    pub(crate) streams: RwLock<BTreeMap<StreamId, Stream>>,

    /// When the stream set last became empty; `None` while streams are open
    idle_since: Mutex<Option<Instant>>,

    groups: GroupSet,

    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        net_conn: NetConn,
        session: Arc<dyn Session>,
        swarm: Weak<SwarmInner>,
        groups: GroupSet,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id: ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)),
                net_conn,
                session,
                swarm,
                streams: RwLock::new(BTreeMap::new()),
                idle_since: Mutex::new(Some(Instant::now())),
                groups,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// The underlying raw connection
    pub fn net_conn(&self) -> &NetConn {
        &self.inner.net_conn
    }

    /// The multiplexing session. Driving it directly bypasses the swarm's
    /// bookkeeping.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.inner.session
    }

    /// The swarm this connection belongs to, while it is alive.
    pub fn swarm(&self) -> Option<Swarm> {
        self.inner.swarm.upgrade().map(Swarm::from_inner)
    }

    pub(crate) fn belongs_to(&self, swarm: &Arc<SwarmInner>) -> bool {
        Weak::as_ptr(&self.inner.swarm) == Arc::as_ptr(swarm)
    }

    /// Open a new stream on this connection.
    pub async fn new_stream(&self) -> Result<Stream> {
        match self.swarm() {
            Some(swarm) => swarm.new_stream_with_conn(self).await,
            None => Err(crate::Error::SwarmClosed),
        }
    }

    /// Snapshot of the streams currently open on this connection.
    pub fn streams(&self) -> Vec<Stream> {
        self.inner.streams.read().values().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.read().len()
    }

    /// How long this connection has carried no streams, if it has none.
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        let idle_since = *self.inner.idle_since.lock();
        idle_since.map(|since| since.elapsed())
    }

    /// Record a change in stream count. Called with the stream set locked.
    pub(crate) fn touch(&self, streams: &BTreeMap<StreamId, Stream>) {
        let mut idle_since = self.inner.idle_since.lock();
        if streams.is_empty() {
            idle_since.get_or_insert_with(Instant::now);
        } else {
            *idle_since = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the session and tear down every stream on this connection.
    ///
    /// Streams are torn down through the swarm, so they also leave the
    /// swarm's stream set. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.inner.session.close().await;

        match self.swarm() {
            Some(swarm) => swarm.teardown_conn(self).await,
            None => {
                let streams: Vec<Stream> = {
                    let mut streams = self.inner.streams.write();
                    std::mem::take(&mut *streams).into_values().collect()
                };
                for stream in streams {
                    if let Err(e) = stream.release().await {
                        trace!("Releasing {} on {}: {}", stream.id(), self.inner.id, e);
                    }
                }
            }
        }

        debug!("Closed connection {}", self.inner.id);
        result
    }

    /// Run the inbound dispatch loop on a background task.
    ///
    /// When the session ends (or the swarm shuts down) the connection is
    /// closed, which removes it from the swarm.
    pub(crate) fn spawn_serve(&self, shutdown: CancellationToken) {
        let conn = self.clone();
        tokio::spawn(async move {
            let dispatcher = conn.clone();
            let handler: InboundHandler = Box::new(move |raw: BoxedStream| {
                let conn = dispatcher.clone();
                async move { conn.dispatch_inbound(raw).await }.boxed()
            });

            tokio::select! {
                _ = conn.inner.session.serve(handler) => {
                    trace!("Serve loop for {} exited", conn.inner.id);
                }
                _ = shutdown.cancelled() => {
                    trace!("Serve loop for {} cancelled", conn.inner.id);
                }
            }

            if let Err(e) = conn.close().await {
                debug!("Closing {} after serve loop: {}", conn.inner.id, e);
            }
        });
    }

    /// Register an inbound stream and hand it to the current stream handler.
    async fn dispatch_inbound(&self, raw: BoxedStream) {
        let Some(swarm) = self.swarm() else {
            trace!("Dropping inbound stream on {}: swarm gone", self.inner.id);
            return;
        };

        let stream = match swarm.setup_stream(raw, self) {
            Ok(stream) => stream,
            Err(e) => {
                trace!("Dropping inbound stream on {}: {}", self.inner.id, e);
                return;
            }
        };

        trace!("Dispatching inbound {} on {}", stream.id(), self.inner.id);
        swarm.stream_handler().call(stream).await;
    }
}

impl Groupable for Connection {
    fn group_set(&self) -> &GroupSet {
        &self.inner.groups
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("net_conn", &self.inner.net_conn)
            .field("streams", &self.stream_count())
            .field("groups", &self.inner.groups)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Whether `conn` is one of `conns` (by identity).
pub fn conn_in_conns(conn: &Connection, conns: &[Connection]) -> bool {
    conns.iter().any(|c| c == conn)
}
