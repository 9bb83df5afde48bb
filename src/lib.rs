//! Connection and stream multiplexing swarm
//!
//! This crate manages many raw network connections, each carrying many
//! logical streams, as a single pool. It allows applications to:
//!
//! - Register raw connections and listeners with a [`Swarm`]
//! - Open streams on a connection picked by a swappable [`SelectConn`] policy
//! - Tag connections and streams with [`Group`]s and select by group
//! - Route streams opened by peers to a swappable [`StreamHandler`]
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite) on streams
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Swarm (listeners, connections, streams, selection, dispatch)
//!     ↓
//! Transport / Session (pluggable multiplexer, e.g. mplex)
//!     ↓
//! NetConn (TCP, in-memory duplex, ...)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use peerstream::transport::mplex::MplexTransport;
//! use peerstream::{NetConn, StreamHandler, Swarm};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio::net::{TcpListener, TcpStream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Server: echo every inbound stream
//!     let server = Swarm::new(MplexTransport::default());
//!     server.set_stream_handler(StreamHandler::echo());
//!     let listener = server.add_listener(TcpListener::bind("127.0.0.1:0").await?)?;
//!     let addr = listener.local_addr().ok_or("listener has no address")?;
//!
//!     // Client: dial and open a stream
//!     let client = Swarm::new(MplexTransport::default());
//!     let tcp = TcpStream::connect(addr).await?;
//!     let mut stream = client.new_stream_with_net_conn(&NetConn::from_tcp(tcp)).await?;
//!
//!     stream.write_all(b"ping").await?;
//!     stream.shutdown().await?;
//!     let mut reply = Vec::new();
//!     stream.read_to_end(&mut reply).await?;
//!
//!     client.close().await?;
//!     server.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod handler;
pub mod listener;
pub mod net;
pub mod stream;
pub mod swarm;
pub mod transport;

// Re-export main types
pub use config::{Config, MplexConfig, SwarmConfig};
pub use connection::{conn_in_conns, ConnId, Connection};
pub use error::{Error, Result};
pub use group::{with_group, Group, GroupSet, Groupable};
pub use handler::{SelectConn, StreamHandler};
pub use listener::{Listener, ListenerId};
pub use net::{NetConn, NetConnId, NetListener};
pub use stream::{Stream, StreamId};
pub use swarm::Swarm;
pub use transport::{BoxedStream, Session, Transport};
