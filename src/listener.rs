use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::group::{GroupSet, Groupable};
use crate::net::NetListener;
use crate::swarm::{Swarm, SwarmInner};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Swarm-unique identity of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A raw listener registered with a swarm.
///
/// Every connection it accepts is added to the swarm as the server side,
/// starting with a snapshot of the listener's groups.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    id: ListenerId,
    local_addr: Option<SocketAddr>,

    /// Owning swarm (non-owning back-reference)
    swarm: Weak<SwarmInner>,

    groups: GroupSet,

    /// Stops the accept loop
    cancel: CancellationToken,
}

impl Listener {
    pub(crate) fn new(
        local_addr: Option<SocketAddr>,
        swarm: Weak<SwarmInner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
                local_addr,
                swarm,
                groups: GroupSet::new(),
                cancel,
            }),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    /// Address the raw listener was bound to, if it reported one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// The swarm this listener feeds, while it is alive.
    pub fn swarm(&self) -> Option<Swarm> {
        self.inner.swarm.upgrade().map(Swarm::from_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop accepting and unregister from the swarm. Idempotent.
    ///
    /// Connections already accepted stay open.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(swarm) = self.swarm() {
            swarm.forget_listener(self);
        }
    }

    /// Accept connections on a background task until the raw listener fails
    /// or this listener is closed.
    ///
    /// The raw listener is dropped when the loop ends.
    pub(crate) fn spawn_accept_loop(&self, net: Box<dyn NetListener>) {
        let listener = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = net.accept() => accepted,
                    _ = listener.inner.cancel.cancelled() => break,
                };

                let net_conn = match accepted {
                    Ok(net_conn) => net_conn,
                    Err(e) => {
                        debug!("Accept on {} failed, stopping: {}", listener.inner.id, e);
                        break;
                    }
                };

                let Some(swarm) = listener.swarm() else {
                    break;
                };
                if swarm.is_closed() {
                    break;
                }

                debug!(
                    "{} accepted {} from {:?}",
                    listener.inner.id,
                    net_conn.id(),
                    net_conn.peer_addr()
                );

                // Handshakes run on their own tasks so a slow one does not
                // hold up the next accept
                let groups = listener.inner.groups.clone();
                tokio::spawn(async move {
                    match swarm.add_conn_with_groups(&net_conn, true, &groups).await {
                        Ok(_) | Err(Error::SwarmClosed) => {}
                        Err(e) => warn!("Failed to add accepted {}: {}", net_conn.id(), e),
                    }
                });
            }

            drop(net);
            listener.close();
            debug!("Accept loop for {} finished", listener.inner.id);
        });
    }
}

impl Groupable for Listener {
    fn group_set(&self) -> &GroupSet {
        &self.inner.groups
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Listener {}

impl Hash for Listener {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("groups", &self.inner.groups)
            .field("closed", &self.is_closed())
            .finish()
    }
}
