use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SwarmConfig;
use crate::connection::{conn_in_conns, ConnId, Connection};
use crate::error::{Error, Result};
use crate::group::{with_group, Group, GroupSet, Groupable};
use crate::handler::{SelectConn, StreamHandler};
use crate::listener::{Listener, ListenerId};
use crate::net::{NetConn, NetConnId, NetListener};
use crate::stream::{Stream, StreamId};
use crate::transport::{BoxedStream, Transport};

/// Orchestrates connections, streams and listeners for one transport.
///
/// `Swarm` is a cheap handle; clones share the same state. Dropping the
/// last handle stops background tasks, but [`Swarm::close`] is the way to
/// shut down cleanly.
///
/// # Locking
///
/// The listener, connection and stream sets each have their own lock, and
/// the stream handler and selector share a fourth. None is held across an
/// `.await`. When the swarm's stream set and a connection's stream set are
/// both needed, the swarm's is always taken first.
///
/// Registration of one raw connection is serialized by a gate keyed on its
/// [`NetConnId`], so a slow handshake only holds up other attempts to add
/// that same raw connection.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

pub(crate) struct SwarmInner {
    transport: Arc<dyn Transport>,
    config: SwarmConfig,

    listeners: RwLock<BTreeMap<ListenerId, Listener>>,
    conns: RwLock<BTreeMap<ConnId, Connection>>,
    streams: RwLock<BTreeMap<StreamId, Stream>>,

    /// Swappable behaviour, read once per dispatch or selection
    hooks: RwLock<Hooks>,

    /// Per raw connection registration gates, present while an add is in
    /// flight
    registering: Mutex<HashMap<NetConnId, Arc<tokio::sync::Mutex<()>>>>,

    /// Parent of every serve loop, accept loop and the idle reaper
    cancel: CancellationToken,

    /// Cancelled as soon as `close` starts; aborts in-flight registrations
    closing: CancellationToken,

    closed: AtomicBool,
}

#[derive(Default)]
struct Hooks {
    handler: StreamHandler,
    selector: SelectConn,
}

impl Drop for SwarmInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Swarm {
    /// Create a swarm bound to `transport`, with default configuration.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_config(transport, SwarmConfig::default())
    }

    /// Create a swarm bound to `transport`.
    ///
    /// When `config` enables idle reclamation this spawns the reaper, so it
    /// must be called inside a tokio runtime.
    pub fn with_config<T: Transport>(transport: T, config: SwarmConfig) -> Self {
        let swarm = Self {
            inner: Arc::new(SwarmInner {
                transport: Arc::new(transport),
                config,
                listeners: RwLock::new(BTreeMap::new()),
                conns: RwLock::new(BTreeMap::new()),
                streams: RwLock::new(BTreeMap::new()),
                hooks: RwLock::new(Hooks::default()),
                registering: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        };

        if let Some(idle_timeout) = swarm.inner.config.idle_timeout() {
            swarm.spawn_reaper(idle_timeout);
        }

        swarm
    }

    pub(crate) fn from_inner(inner: Arc<SwarmInner>) -> Self {
        Self { inner }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ---- handler and selector ----

    /// Replace the inbound stream handler. `None` restores the default,
    /// which closes every inbound stream.
    ///
    /// Dispatches already in progress keep the handler they started with.
    pub fn set_stream_handler(&self, handler: impl Into<Option<StreamHandler>>) {
        self.inner.hooks.write().handler = handler.into().unwrap_or_default();
    }

    pub fn stream_handler(&self) -> StreamHandler {
        self.inner.hooks.read().handler.clone()
    }

    /// Replace the default selector. `None` restores uniform random choice.
    pub fn set_select_conn(&self, selector: impl Into<Option<SelectConn>>) {
        self.inner.hooks.write().selector = selector.into().unwrap_or_default();
    }

    pub fn select_conn(&self) -> SelectConn {
        self.inner.hooks.read().selector.clone()
    }

    // ---- snapshots ----

    /// Live connections, in registration order.
    pub fn conns(&self) -> Vec<Connection> {
        self.inner.conns.read().values().cloned().collect()
    }

    /// Live streams, in registration order.
    pub fn streams(&self) -> Vec<Stream> {
        self.inner.streams.read().values().cloned().collect()
    }

    /// Live listeners, in registration order.
    pub fn listeners(&self) -> Vec<Listener> {
        self.inner.listeners.read().values().cloned().collect()
    }

    pub fn conns_with_group(&self, group: &Group) -> Vec<Connection> {
        with_group(group, &self.conns())
    }

    pub fn streams_with_group(&self, group: &Group) -> Vec<Stream> {
        with_group(group, &self.streams())
    }

    pub fn add_conn_to_group(&self, conn: &Connection, group: Group) {
        conn.add_group(group);
    }

    // ---- listeners ----

    /// Register a raw listener and start accepting on it.
    ///
    /// Accepted connections are added as the server side. If the raw
    /// listener fails the loop ends quietly and the listener unregisters.
    pub fn add_listener<L: NetListener>(&self, net: L) -> Result<Listener> {
        if self.is_closed() {
            return Err(Error::SwarmClosed);
        }

        let listener = Listener::new(
            net.local_addr().ok(),
            Arc::downgrade(&self.inner),
            self.inner.cancel.child_token(),
        );
        self.inner
            .listeners
            .write()
            .insert(listener.id(), listener.clone());

        if self.is_closed() {
            listener.close();
            return Err(Error::SwarmClosed);
        }

        listener.spawn_accept_loop(Box::new(net));
        debug!("Added {} on {:?}", listener.id(), listener.local_addr());
        Ok(listener)
    }

    pub(crate) fn forget_listener(&self, listener: &Listener) {
        if self.inner.listeners.write().remove(&listener.id()).is_some() {
            trace!("Removed {}", listener.id());
        }
    }

    // ---- connections ----

    /// Wrap `net_conn` in a multiplexing session and register it.
    ///
    /// Adding a raw connection that is already registered returns the
    /// existing [`Connection`] without starting a second session.
    pub async fn add_conn(&self, net_conn: &NetConn, is_server: bool) -> Result<Connection> {
        self.add_conn_with_groups(net_conn, is_server, &GroupSet::new())
            .await
    }

    /// [`Swarm::add_conn`], starting the new connection with a copy of
    /// `groups`.
    pub(crate) async fn add_conn_with_groups(
        &self,
        net_conn: &NetConn,
        is_server: bool,
        groups: &GroupSet,
    ) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::SwarmClosed);
        }

        let gate = RegistrationGate::claim(&self.inner, net_conn.id());
        let _registering = tokio::select! {
            held = gate.lock.lock() => held,
            _ = self.inner.closing.cancelled() => return Err(Error::SwarmClosed),
        };

        if let Some(existing) = self.find_conn(net_conn) {
            trace!("{} already registered as {}", net_conn.id(), existing.id());
            return Ok(existing);
        }

        let session = tokio::select! {
            session = self.inner.transport.new_conn(net_conn, is_server) => session?,
            _ = self.inner.closing.cancelled() => {
                debug!("Abandoned handshake on {}: swarm closing", net_conn.id());
                return Err(Error::SwarmClosed);
            }
        };
        let conn = Connection::new(
            net_conn.clone(),
            session,
            Arc::downgrade(&self.inner),
            groups.clone(),
        );

        // Checked under the set's lock so `close` either sees the new
        // connection or this add sees the swarm closed
        let registered = {
            let mut conns = self.inner.conns.write();
            if self.is_closed() {
                false
            } else {
                conns.insert(conn.id(), conn.clone());
                true
            }
        };
        if !registered {
            if let Err(e) = conn.close().await {
                trace!("Closing unregistered {}: {}", conn.id(), e);
            }
            return Err(Error::SwarmClosed);
        }

        conn.spawn_serve(self.inner.cancel.child_token());

        debug!(
            "Added {} over {} ({})",
            conn.id(),
            net_conn.id(),
            if is_server { "server" } else { "client" }
        );
        Ok(conn)
    }

    fn find_conn(&self, net_conn: &NetConn) -> Option<Connection> {
        self.inner
            .conns
            .read()
            .values()
            .find(|conn| conn.net_conn() == net_conn)
            .cloned()
    }

    /// Remove a closing connection and tear down its streams.
    pub(crate) async fn teardown_conn(&self, conn: &Connection) {
        if self.inner.conns.write().remove(&conn.id()).is_some() {
            trace!("Removed {}", conn.id());
        }

        for stream in conn.streams() {
            if let Err(e) = self.remove_stream(&stream).await {
                trace!("Closing {} on {}: {}", stream.id(), conn.id(), e);
            }
        }
    }

    /// Close connections that have carried no streams for at least
    /// `idle_timeout`. Returns how many were closed.
    pub async fn reap_idle_conns(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<Connection> = self
            .conns()
            .into_iter()
            .filter(|conn| conn.idle_for().is_some_and(|idle| idle >= idle_timeout))
            .collect();

        for conn in &idle {
            debug!("Closing idle {}", conn.id());
            if let Err(e) = conn.close().await {
                debug!("Closing idle {} failed: {}", conn.id(), e);
            }
        }
        idle.len()
    }

    fn spawn_reaper(&self, idle_timeout: Duration) {
        let swarm = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let mut ticker = tokio::time::interval(self.inner.config.gc_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let Some(inner) = Weak::upgrade(&swarm) else {
                    break;
                };
                Swarm::from_inner(inner).reap_idle_conns(idle_timeout).await;
            }
            trace!("Idle reaper stopped");
        });
    }

    // ---- streams ----

    /// Open a stream on a connection chosen by the current selector.
    pub async fn new_stream(&self) -> Result<Stream> {
        self.new_stream_select_conn(&self.select_conn()).await
    }

    /// Open a stream on a connection chosen by `selector`.
    pub async fn new_stream_select_conn(&self, selector: &SelectConn) -> Result<Stream> {
        let conns = self.conns();
        self.new_stream_among(&conns, selector).await
    }

    /// Open a stream on a connection in `group`, chosen by the current
    /// selector.
    pub async fn new_stream_with_group(&self, group: &Group) -> Result<Stream> {
        let conns = self.conns_with_group(group);
        self.new_stream_among(&conns, &self.select_conn()).await
    }

    /// Register `net_conn` as the client side (or reuse its connection) and
    /// open a stream on it.
    pub async fn new_stream_with_net_conn(&self, net_conn: &NetConn) -> Result<Stream> {
        let conn = self.add_conn(net_conn, false).await?;
        self.new_stream_with_conn(&conn).await
    }

    /// Open a stream on `conn`, which must be registered with this swarm.
    pub async fn new_stream_with_conn(&self, conn: &Connection) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SwarmClosed);
        }
        if !conn.belongs_to(&self.inner) {
            return Err(Error::InvalidArgument(format!(
                "{} belongs to a different swarm",
                conn.id()
            )));
        }
        if !self.inner.conns.read().contains_key(&conn.id()) {
            return Err(Error::InvalidArgument(format!(
                "{} is not registered",
                conn.id()
            )));
        }

        let raw = conn.session().open_stream().await?;
        self.setup_stream(raw, conn)
    }

    async fn new_stream_among(&self, conns: &[Connection], selector: &SelectConn) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SwarmClosed);
        }
        if conns.is_empty() {
            return Err(Error::NoConnections);
        }

        let conn = match selector.select(conns) {
            Some(conn) if conn_in_conns(&conn, conns) => conn,
            _ => return Err(Error::InvalidConnSelected),
        };
        self.new_stream_with_conn(&conn).await
    }

    /// Wrap a transport stream and register it with both the swarm and
    /// `conn`.
    ///
    /// Fails if `conn` is already closing, so a stream is never registered
    /// after its connection's teardown has taken its snapshot.
    pub(crate) fn setup_stream(&self, raw: BoxedStream, conn: &Connection) -> Result<Stream> {
        let stream = Stream::new(raw, conn);
        {
            let mut streams = self.inner.streams.write();
            let mut conn_streams = conn.inner().streams.write();
            if conn.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            streams.insert(stream.id(), stream.clone());
            conn_streams.insert(stream.id(), stream.clone());
            conn.touch(&conn_streams);
        }

        trace!("Set up {} on {}", stream.id(), conn.id());
        Ok(stream)
    }

    /// The single teardown path for streams: drop it from both stream sets,
    /// then release the transport stream.
    pub(crate) async fn remove_stream(&self, stream: &Stream) -> Result<()> {
        let conn = stream.conn();
        {
            let mut streams = self.inner.streams.write();
            streams.remove(&stream.id());
            if let Some(conn) = &conn {
                let mut conn_streams = conn.inner().streams.write();
                if conn_streams.remove(&stream.id()).is_some() {
                    conn.touch(&conn_streams);
                }
            }
        }

        stream.release().await
    }

    // ---- shutdown ----

    /// Close every listener, then every connection and its streams.
    ///
    /// Afterwards all three live sets are empty and further registration
    /// fails with [`Error::SwarmClosed`]. Closing again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.closing.cancel();

        let listeners: Vec<Listener> =
            std::mem::take(&mut *self.inner.listeners.write()).into_values().collect();
        for listener in &listeners {
            listener.close();
        }

        let conns: Vec<Connection> =
            std::mem::take(&mut *self.inner.conns.write()).into_values().collect();
        let mut result = Ok(());
        for conn in &conns {
            if let Err(e) = conn.close().await {
                warn!("Error closing {}: {}", conn.id(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let stragglers: Vec<Stream> =
            std::mem::take(&mut *self.inner.streams.write()).into_values().collect();
        for stream in &stragglers {
            if let Err(e) = stream.release().await {
                trace!("Releasing {}: {}", stream.id(), e);
            }
        }

        self.inner.cancel.cancel();
        debug!(
            "Swarm closed ({} listeners, {} connections)",
            listeners.len(),
            conns.len()
        );
        result
    }
}

/// Claim on the registration gate of one raw connection.
///
/// The gate is dropped from the swarm's map once no add holds a claim on it.
struct RegistrationGate<'a> {
    swarm: &'a SwarmInner,
    id: NetConnId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> RegistrationGate<'a> {
    fn claim(swarm: &'a SwarmInner, id: NetConnId) -> Self {
        let lock = swarm.registering.lock().entry(id).or_default().clone();
        Self { swarm, id, lock }
    }
}

impl Drop for RegistrationGate<'_> {
    fn drop(&mut self) {
        let mut registering = self.swarm.registering.lock();
        // One reference in the map plus ours: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            registering.remove(&self.id);
        }
    }
}

impl PartialEq for Swarm {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Swarm {}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("listeners", &self.inner.listeners.read().len())
            .field("conns", &self.inner.conns.read().len())
            .field("streams", &self.inner.streams.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mplex::MplexTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn swarm() -> Swarm {
        Swarm::new(MplexTransport::default())
    }

    /// A client swarm with one connection to an echoing server swarm.
    async fn echo_pair() -> (Swarm, Swarm, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = swarm();
        let server = swarm();
        server.set_stream_handler(StreamHandler::echo());

        let conn = client.add_conn(&NetConn::new(a), false).await.unwrap();
        server.add_conn(&NetConn::new(b), true).await.unwrap();
        (client, server, conn)
    }

    #[tokio::test]
    async fn test_add_conn_is_idempotent() {
        let (a, _b) = tokio::io::duplex(1024);
        let swarm = swarm();
        let net_conn = NetConn::new(a);

        let first = swarm.add_conn(&net_conn, false).await.unwrap();
        let second = swarm.add_conn(&net_conn, false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(swarm.conns().len(), 1);
    }

    #[tokio::test]
    async fn test_new_stream_without_conns() {
        let swarm = swarm();
        assert!(matches!(swarm.new_stream().await, Err(Error::NoConnections)));
        assert!(matches!(
            swarm.new_stream_with_group(&Group::new("x")).await,
            Err(Error::NoConnections)
        ));
    }

    #[tokio::test]
    async fn test_selector_contract() {
        let (client, _server, conn) = echo_pair().await;

        let none = SelectConn::new(|_| None);
        assert!(matches!(
            client.new_stream_select_conn(&none).await,
            Err(Error::InvalidConnSelected)
        ));

        let (x, _y) = tokio::io::duplex(1024);
        let other = swarm();
        let stranger = other.add_conn(&NetConn::new(x), false).await.unwrap();
        let outside = SelectConn::new(move |_| Some(stranger.clone()));
        assert!(matches!(
            client.new_stream_select_conn(&outside).await,
            Err(Error::InvalidConnSelected)
        ));

        let first = SelectConn::new(|conns| conns.first().cloned());
        let stream = client.new_stream_select_conn(&first).await.unwrap();
        assert_eq!(stream.conn(), Some(conn));
    }

    #[tokio::test]
    async fn test_new_stream_with_foreign_conn() {
        let (client, _server, _conn) = echo_pair().await;
        let (x, _y) = tokio::io::duplex(1024);
        let other = swarm();
        let foreign = other.add_conn(&NetConn::new(x), false).await.unwrap();

        assert!(matches!(
            client.new_stream_with_conn(&foreign).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_new_stream_with_closed_conn() {
        let (client, _server, conn) = echo_pair().await;
        conn.close().await.unwrap();

        assert!(client.conns().is_empty());
        assert!(matches!(
            client.new_stream_with_conn(&conn).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_registered_in_both_sets() {
        let (client, _server, conn) = echo_pair().await;
        let stream = conn.new_stream().await.unwrap();

        assert_eq!(client.streams(), vec![stream.clone()]);
        assert_eq!(conn.streams(), vec![stream.clone()]);
        assert!(conn.idle_for().is_none());

        stream.close().await.unwrap();
        assert!(client.streams().is_empty());
        assert!(conn.streams().is_empty());
        assert!(conn.idle_for().is_some());

        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_through_swarm() {
        let (client, _server, _conn) = echo_pair().await;
        let mut stream = client.new_stream().await.unwrap();

        stream.write_all(b"hello swarm").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut buf = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .expect("Timeout waiting for echo")
            .unwrap();
        assert_eq!(buf, b"hello swarm");
    }

    #[tokio::test]
    async fn test_stream_inherits_conn_groups() {
        let (client, _server, conn) = echo_pair().await;
        client.add_conn_to_group(&conn, Group::new("a"));
        conn.add_group(Group::new("b"));

        let stream = client.new_stream_with_group(&Group::new("a")).await.unwrap();
        assert_eq!(stream.groups(), vec![Group::new("a"), Group::new("b")]);

        stream.add_group(Group::new("c"));
        assert!(!conn.in_group(&Group::new("c")));
        assert_eq!(client.streams_with_group(&Group::new("c")), vec![stream]);
    }

    #[tokio::test]
    async fn test_handler_and_selector_fallback() {
        let swarm = swarm();
        swarm.set_select_conn(SelectConn::round_robin());
        swarm.set_select_conn(None);
        swarm.set_stream_handler(None);

        assert!(swarm.select_conn().select(&[]).is_none());
    }

    #[tokio::test]
    async fn test_closed_swarm_rejects_work() {
        let (client, _server, _conn) = echo_pair().await;
        client.close().await.unwrap();

        assert!(client.conns().is_empty());
        assert!(client.streams().is_empty());
        assert!(matches!(client.new_stream().await, Err(Error::SwarmClosed)));

        let (x, _y) = tokio::io::duplex(1024);
        assert!(matches!(
            client.add_conn(&NetConn::new(x), false).await,
            Err(Error::SwarmClosed)
        ));

        client.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_conns() {
        let (client, _server, conn) = echo_pair().await;
        let stream = conn.new_stream().await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(client.reap_idle_conns(Duration::from_secs(5)).await, 0);

        stream.close().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(client.reap_idle_conns(Duration::from_secs(5)).await, 1);
        assert!(conn.is_closed());
        assert!(client.conns().is_empty());
    }
}
