//! Stream multiplexer contract (spec §4.2, C2).
//!
//! This is the one place the crate reaches for a dependency outside the
//! teacher's own table, because the teacher never multiplexes: one NFS
//! connection there is one unmultiplexed TCP socket. The pack's
//! `bwpge-smb-rs` repo shows the idiom for wrapping a transport crate
//! behind a small seam (`smb-transport`); this module plays the same role
//! for [`yamux`], chosen because it multiplexes many full-duplex streams
//! over exactly one `AsyncRead + AsyncWrite`, matching "one upgraded-HTTP
//! TCP connection" from spec §4.3 precisely.
//!
//! Everything above this module only depends on [`MuxStream`] and
//! [`MuxEndpoint`] — never on `yamux` types directly — so swapping the
//! multiplexer is a one-file change.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

/// Which side of the TCP connection this endpoint plays (spec §4.3: the
/// upgrade initiator is always the client; the multiplexer needs to know
/// this to decide stream-id parity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// One full-duplex logical stream carved out of a multiplexed connection.
/// Implements `tokio::io::{AsyncRead, AsyncWrite}` so callers apply the
/// usual `tokio::time::timeout` for per-call deadlines (spec §4.3).
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
}

impl MuxStream {
    fn new(inner: yamux::Stream) -> Self {
        Self { inner: inner.compat() }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One multiplexed connection: lets either side open fresh outbound streams
/// and accept inbound ones concurrently — `yamux::Control` is a cheap,
/// cloneable handle to the background-driven connection, so opening a
/// stream never blocks behind a concurrent `accept_stream` (spec §4.9/§4.10
/// need the server to call into an agent over the same connection the agent
/// dialed, while still being able to drain any inbound streams). Reports
/// whether the underlying connection has gone away (spec §4.2's "closed
/// indicator").
pub struct MuxEndpoint {
    control: yamux::Control,
    incoming: Mutex<mpsc::Receiver<io::Result<MuxStream>>>,
    closed: Arc<AtomicBool>,
    driver: tokio::task::JoinHandle<()>,
}

impl MuxEndpoint {
    /// Takes ownership of an already-upgraded TCP socket and starts
    /// multiplexing it. `side` must agree between the two ends of the
    /// connection (one `Client`, one `Server`).
    pub fn new(socket: TcpStream, side: Side) -> Self {
        let mode = match side {
            Side::Client => yamux::Mode::Client,
            Side::Server => yamux::Mode::Server,
        };
        let mut conn = yamux::Connection::new(socket.compat(), yamux::Config::default(), mode);
        let control = conn.control();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_driver = closed.clone();
        let (tx, incoming) = mpsc::channel(64);

        // Drives the connection: yamux requires someone to keep polling
        // it so that flow control and incoming streams make progress,
        // even on the client side where no one calls `accept_stream`.
        let driver = tokio::spawn(async move {
            loop {
                match conn.next().await {
                    Some(Ok(stream)) => {
                        if tx.send(Ok(MuxStream::new(stream))).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(io::Error::other(err))).await;
                        break;
                    }
                    None => break,
                }
            }
            closed_for_driver.store(true, Ordering::SeqCst);
        });

        Self { control, incoming: Mutex::new(incoming), closed, driver }
    }

    /// Opens a fresh logical stream for one RPC call (spec §4.3: "A single
    /// call occupies exactly one stream"). Safe to call concurrently with
    /// itself and with [`Self::accept_stream`].
    pub async fn open_stream(&self) -> io::Result<MuxStream> {
        self.control.clone().open_stream().await.map(MuxStream::new).map_err(io::Error::other)
    }

    /// Accepts the next inbound stream (server accept loop, spec §4.3).
    /// Only one caller should drain this at a time; the lock exists so the
    /// method can take `&self` rather than `&mut self`, not to allow
    /// multiple concurrent accept loops.
    pub async fn accept_stream(&self) -> Option<io::Result<MuxStream>> {
        self.incoming.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Takes `&self`, not owned `self`: an endpoint stored as `Arc<MuxEndpoint>`
    /// (spec §4.9/§4.10's shared call+accept use) has no single owner to
    /// consume, so closing goes through a cloned `Control` handle instead.
    pub async fn close(&self) {
        let _ = self.control.clone().close().await;
        self.closed.store(true, Ordering::SeqCst);
        self.driver.abort();
    }
}
