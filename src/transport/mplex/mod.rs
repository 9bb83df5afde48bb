//! Minimal stream multiplexer over any byte stream.
//!
//! Each session runs two background tasks: a reader that decodes frames and
//! routes them to streams, and a writer that drains an outgoing frame queue.
//! Flow control is left to the underlying connection.
//!
//! # Architecture
//!
//! ```text
//! MplexStream ─┐                       ┌─> StreamShared (recv buffer)
//! MplexStream ─┼─> outgoing queue ─> writer_task ─> NetConn ─> reader_task
//! MplexStream ─┘                                                  │
//!                                    inbound queue <─ new SYN ────┘
//! ```

mod frame;
mod stream;

pub use frame::{
    Frame, FrameCodec, FLAG_FIN, FLAG_RST, FLAG_SYN, HEADER_SIZE, MAX_DATA_SIZE, MAX_FRAME_SIZE,
};
pub use stream::MplexStream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MplexConfig;
use crate::error::{Error, Result};
use crate::net::{BoxedIo, NetConn};
use crate::transport::{BoxedStream, InboundHandler, Session, Transport};

use self::stream::StreamShared;

type FrameSink = SplitSink<Framed<BoxedIo, FrameCodec>, Frame>;
type FrameSource = SplitStream<Framed<BoxedIo, FrameCodec>>;

/// Transport producing [`MplexSession`]s.
#[derive(Debug, Clone, Default)]
pub struct MplexTransport {
    config: MplexConfig,
}

impl MplexTransport {
    pub fn new(config: MplexConfig) -> Self {
        Self { config }
    }

    /// Start a session directly, without going through a swarm.
    pub fn session(&self, conn: &NetConn, is_server: bool) -> Result<Arc<MplexSession>> {
        let io = conn.take_io()?;
        Ok(MplexSession::start(io, is_server, &self.config))
    }
}

#[async_trait]
impl Transport for MplexTransport {
    async fn new_conn(&self, conn: &NetConn, is_server: bool) -> Result<Arc<dyn Session>> {
        let session: Arc<dyn Session> = self.session(conn, is_server)?;
        Ok(session)
    }
}

/// State shared between a session, its streams and its background tasks.
pub(crate) struct SessionShared {
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    max_data_size: usize,
    cancel: CancellationToken,
}

impl SessionShared {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn forget(&self, id: u32) {
        self.streams.lock().remove(&id);
    }

    /// Reset every stream and stop the background tasks.
    fn shutdown(&self) {
        self.cancel.cancel();
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.reset();
        }
    }
}

/// One multiplexed session over one raw connection.
pub struct MplexSession {
    shared: Arc<SessionShared>,

    /// Streams opened by the peer, waiting for `serve`
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<MplexStream>>,

    /// Next stream ID for outgoing streams (odd for dialer, even for listener)
    next_stream_id: AtomicU32,

    is_server: bool,
}

impl MplexSession {
    fn start(io: BoxedIo, is_server: bool, config: &MplexConfig) -> Arc<Self> {
        let max_data_size = config.data_size();
        let (sink, source) = Framed::new(io, FrameCodec::new(max_data_size)).split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SessionShared {
            streams: Mutex::new(HashMap::new()),
            outgoing: outgoing_tx,
            max_data_size,
            cancel: CancellationToken::new(),
        });

        let session = Arc::new(Self {
            shared: shared.clone(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            next_stream_id: AtomicU32::new(if is_server { 2 } else { 1 }),
            is_server,
        });

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_task(sink, outgoing_rx, &writer_shared.cancel).await {
                debug!("Writer task error: {}", e);
            }
            writer_shared.shutdown();
        });

        tokio::spawn(reader_task(source, shared, inbound_tx, is_server));

        session
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Get the number of open streams
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Allocate a new stream ID. Fails once the ID space is used up
    /// rather than wrapping onto IDs that may still be live.
    fn allocate_stream_id(&self) -> Result<u32> {
        self.next_stream_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .map_err(|_| Error::StreamIdsExhausted)
    }

    /// Open a stream without boxing it.
    pub fn open(&self) -> Result<MplexStream> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.allocate_stream_id()?;
        let stream = Arc::new(StreamShared::new(id));
        self.shared.streams.lock().insert(id, stream.clone());

        if let Err(e) = self.shared.send(Frame::syn(id)) {
            self.shared.forget(id);
            return Err(e);
        }

        trace!("Opened stream {}", id);
        Ok(MplexStream::new(stream, self.shared.clone()))
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept(&self) -> Result<MplexStream> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            stream = inbound.recv() => stream.ok_or(Error::ConnectionClosed),
            _ = self.shared.cancel.cancelled() => Err(Error::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Session for MplexSession {
    async fn open_stream(&self) -> Result<BoxedStream> {
        Ok(Box::new(self.open()?))
    }

    async fn serve(&self, mut handler: InboundHandler) {
        while let Ok(stream) = self.accept().await {
            handler(Box::new(stream)).await;
        }
        trace!("Serve loop finished");
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.cancel.is_cancelled() {
            debug!("Closing mplex session");
            self.shared.shutdown();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for MplexSession {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Background reader task
///
/// Decodes frames from the connection and routes them to streams. New SYNs
/// become inbound streams. Ends the session on EOF, decode error or cancel.
async fn reader_task(
    mut source: FrameSource,
    shared: Arc<SessionShared>,
    inbound: mpsc::UnboundedSender<MplexStream>,
    is_server: bool,
) {
    loop {
        let frame = tokio::select! {
            frame = source.next() => frame,
            _ = shared.cancel.cancelled() => {
                trace!("Reader task cancelled");
                break;
            }
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("Failed to decode frame: {}", e);
                break;
            }
            None => {
                debug!("Connection closed by peer");
                break;
            }
        };

        let id = frame.stream_id;

        if frame.is_syn() {
            // Peer-initiated IDs have the opposite parity to ours
            let ours = if is_server { id % 2 == 0 } else { id % 2 == 1 };
            if ours {
                warn!("Peer opened stream {} with our own ID parity, resetting", id);
                let _ = shared.send(Frame::rst(id));
                continue;
            }

            let stream = {
                let mut streams = shared.streams.lock();
                if streams.contains_key(&id) {
                    debug!("Duplicate SYN for stream {}", id);
                    continue;
                }
                let stream = Arc::new(StreamShared::new(id));
                streams.insert(id, stream.clone());
                stream
            };

            trace!("Accepted incoming stream {}", id);
            if inbound
                .send(MplexStream::new(stream, shared.clone()))
                .is_err()
            {
                trace!("Inbound queue closed, dropping stream {}", id);
            }
            continue;
        }

        let stream = shared.streams.lock().get(&id).cloned();
        let Some(stream) = stream else {
            trace!("Frame for unknown stream {} (flags={:02x})", id, frame.flags);
            continue;
        };

        if frame.is_rst() {
            shared.forget(id);
            stream.reset();
            continue;
        }

        let fin = frame.is_fin();
        if !frame.data.is_empty() {
            stream.push_data(frame.data);
        }

        if fin {
            // Hold the table while waking readers so a woken reader never
            // observes a fully finished stream that is still registered
            let mut streams = shared.streams.lock();
            if stream.remote_fin() {
                streams.remove(&id);
            }
        }
    }

    shared.shutdown();
}

/// Background writer task
///
/// Drains queued frames into the connection, flushing once the queue is empty.
async fn writer_task(
    mut sink: FrameSink,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                sink.feed(frame).await?;
                while let Ok(frame) = outgoing.try_recv() {
                    sink.feed(frame).await?;
                }
                sink.flush().await?;
            }
            _ = cancel.cancelled() => {
                // Deliver whatever was queued before the session closed
                while let Ok(frame) = outgoing.try_recv() {
                    sink.feed(frame).await?;
                }
                break;
            }
        }
    }

    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (Arc<MplexSession>, Arc<MplexSession>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let transport = MplexTransport::default();
        let client = transport.session(&NetConn::new(a), false).unwrap();
        let server = transport.session(&NetConn::new(b), true).unwrap();
        (client, server)
    }

    async fn accept(session: &MplexSession) -> MplexStream {
        tokio::time::timeout(Duration::from_secs(5), session.accept())
            .await
            .expect("Timeout accepting stream")
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_id_allocation() {
        let (client, server) = session_pair();

        assert_eq!(client.open().unwrap().id(), 1);
        assert_eq!(client.open().unwrap().id(), 3);
        assert_eq!(server.open().unwrap().id(), 2);
        assert_eq!(server.open().unwrap().id(), 4);
    }

    #[tokio::test]
    async fn test_stream_ids_exhausted() {
        let (client, _server) = session_pair();
        client
            .next_stream_id
            .store(u32::MAX - 2, Ordering::Relaxed);

        assert_eq!(client.open().unwrap().id(), u32::MAX - 2);
        assert!(matches!(client.open(), Err(Error::StreamIdsExhausted)));
        assert_eq!(client.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_data_frame_with_fin() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = MplexTransport::default()
            .session(&NetConn::new(b), true)
            .unwrap();
        let mut peer = Framed::new(a, FrameCodec::default());

        peer.send(Frame::syn(1)).await.unwrap();
        peer.send(Frame::new(1, FLAG_FIN, Bytes::from_static(b"last words")))
            .await
            .unwrap();

        let mut inbound = accept(&server).await;
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), inbound.read_to_end(&mut received))
            .await
            .expect("Timeout waiting for EOF")
            .unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_open_write_read() {
        let (client, server) = session_pair();

        let mut outbound = client.open().unwrap();
        outbound.write_all(b"ping").await.unwrap();

        let mut inbound = accept(&server).await;
        assert_eq!(inbound.id(), outbound.id());

        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_write_is_split_into_frames() {
        let (client, server) = session_pair();

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let mut outbound = client.open().unwrap();
        outbound.write_all(&payload).await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = accept(&server).await;
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_fin_gives_eof_and_blocks_writes() {
        let (client, server) = session_pair();

        let mut outbound = client.open().unwrap();
        outbound.shutdown().await.unwrap();

        let err = outbound.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let mut inbound = accept(&server).await;
        let mut buf = Vec::new();
        assert_eq!(inbound.read_to_end(&mut buf).await.unwrap(), 0);

        // Half-closed: the other direction still works
        inbound.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_drop_resets_peer() {
        let (client, server) = session_pair();

        let outbound = client.open().unwrap();
        let mut inbound = accept(&server).await;
        drop(outbound);

        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(Duration::from_secs(5), inbound.read(&mut buf))
            .await
            .expect("Timeout waiting for reset")
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_close_unblocks_reads_and_serve() {
        let (client, server) = session_pair();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .serve(Box::new(|_stream: BoxedStream| async {}.boxed()))
                    .await;
            })
        };

        let mut outbound = client.open().unwrap();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            outbound.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        Session::close(client.as_ref()).await.unwrap();
        assert!(client.is_closed());
        assert!(client.open().is_err());

        let read = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("Read did not return after close")
            .unwrap();
        assert!(read.is_err());

        // Peer sees EOF on the connection and ends its session
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("Serve did not return after peer closed")
            .unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_serve_dispatches_in_order() {
        let (client, server) = session_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(Box::new(move |mut stream: BoxedStream| {
                        let tx = tx.clone();
                        async move {
                            let mut byte = [0u8; 1];
                            if stream.read_exact(&mut byte).await.is_ok() {
                                let _ = tx.send(byte[0]);
                            }
                        }
                        .boxed()
                    }))
                    .await;
            }
        });

        let mut streams = Vec::new();
        for i in 0..5u8 {
            let mut stream = client.open().unwrap();
            stream.write_all(&[i]).await.unwrap();
            streams.push(stream);
        }

        for expected in 0..5u8 {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("Timeout waiting for dispatch")
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_stream_count_tracks_lifecycle() {
        let (client, server) = session_pair();

        let mut outbound = client.open().unwrap();
        assert_eq!(client.stream_count(), 1);

        let mut inbound = accept(&server).await;
        assert_eq!(server.stream_count(), 1);

        outbound.shutdown().await.unwrap();
        inbound.shutdown().await.unwrap();
        let mut buf = Vec::new();
        outbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(client.stream_count(), 0);

        drop(inbound);
        assert_eq!(server.stream_count(), 0);
    }
}
