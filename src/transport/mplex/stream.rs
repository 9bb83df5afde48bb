use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::frame::Frame;
use super::SessionShared;

/// Receive-side and close state of one stream, shared with the reader task.
pub(super) struct StreamShared {
    pub(super) id: u32,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    /// Data received from the peer, in order
    recv: VecDeque<Bytes>,
    /// Peer sent FIN; reads drain `recv` then return EOF
    remote_fin: bool,
    /// We sent FIN; further writes fail
    local_fin: bool,
    /// Stream aborted by either side or by session teardown
    reset: bool,
    read_waker: Option<Waker>,
}

impl StreamShared {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState::default()),
        }
    }

    pub(super) fn push_data(&self, data: Bytes) {
        let mut state = self.state.lock();
        if state.reset || state.remote_fin {
            trace!("Dropping {} bytes for finished stream {}", data.len(), self.id);
            return;
        }
        state.recv.push_back(data);
        wake(&mut state);
    }

    /// Returns `true` once both directions are finished.
    pub(super) fn remote_fin(&self) -> bool {
        let mut state = self.state.lock();
        state.remote_fin = true;
        wake(&mut state);
        state.local_fin
    }

    pub(super) fn reset(&self) {
        let mut state = self.state.lock();
        state.reset = true;
        state.recv.clear();
        wake(&mut state);
    }
}

fn wake(state: &mut StreamState) {
    if let Some(waker) = state.read_waker.take() {
        waker.wake();
    }
}

/// One logical stream over an mplex session.
///
/// Writes are queued to the session writer without blocking; reads return
/// buffered data as it arrives.
pub struct MplexStream {
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
}

impl MplexStream {
    pub(super) fn new(shared: Arc<StreamShared>, session: Arc<SessionShared>) -> Self {
        Self { shared, session }
    }

    /// Stream identifier on the wire
    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl AsyncRead for MplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock();

        if state.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }

        let mut copied = false;
        while buf.remaining() > 0 {
            let Some(chunk) = state.recv.front_mut() else {
                break;
            };
            let n = buf.remaining().min(chunk.len());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                state.recv.pop_front();
            }
            copied = true;
        }

        if copied || state.remote_fin {
            return Poll::Ready(Ok(()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        {
            let state = self.shared.state.lock();
            if state.reset {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )));
            }
            if state.local_fin {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed for writing",
                )));
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(self.session.max_data_size);
        let frame = Frame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n]));
        if self.session.send(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let finished = {
            let mut state = self.shared.state.lock();
            if state.local_fin || state.reset {
                return Poll::Ready(Ok(()));
            }
            state.local_fin = true;
            state.remote_fin
        };

        // A closed session already reset every stream
        let _ = self.session.send(Frame::fin(self.shared.id));
        if finished {
            self.session.forget(self.shared.id);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MplexStream {
    fn drop(&mut self) {
        let abort = {
            let mut state = self.shared.state.lock();
            let abort = !state.local_fin && !state.reset;
            state.reset = true;
            wake(&mut state);
            abort
        };

        if abort {
            trace!("Resetting dropped stream {}", self.shared.id);
            let _ = self.session.send(Frame::rst(self.shared.id));
        }
        self.session.forget(self.shared.id);
    }
}
