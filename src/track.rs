//! Probe-scoped connection accounting.
//!
//! Every socket a probe opens is wrapped in [`Tracked`], tied to the probe's
//! own [`ConnTracker`]. Closing happens through ownership (dropping the
//! wrapper closes the socket), so the tracker's open/closed counters let
//! tests assert that nothing opened inside a probe survives it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
pub struct ConnTracker {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ConnTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track<S>(self: &Arc<Self>, inner: S) -> Tracked<S> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        Tracked {
            inner,
            tracker: Arc::clone(self),
        }
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Sockets opened but not yet dropped.
    pub fn live(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

/// Socket wrapper counted by a [`ConnTracker`]. Dropping it closes the
/// underlying stream and records the close.
#[derive(Debug)]
pub struct Tracked<S> {
    inner: S,
    tracker: Arc<ConnTracker>,
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        self.tracker.closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
