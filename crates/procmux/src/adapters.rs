//! Stream adapters over negotiated pipe endpoints.
//!
//! Each adapter owes the close ledger exactly one completion. It pays on EOF,
//! on a terminal I/O error, on shutdown, or at the latest when dropped, and
//! never more than once.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use procmux_core::{PipeReadEnd, PipeWriteEnd};

use crate::handle::Shared;

struct CloseGuard {
    shared: Arc<Shared>,
    completed: bool,
}

impl CloseGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            completed: false,
        }
    }

    fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            self.shared.complete_close();
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Readable adapter for the child's stdout or stderr.
///
/// Keeps the pipe alive past process exit so buffered output drains; EOF (or
/// dropping the adapter) releases its slot on the close ledger.
pub struct PipeReader {
    inner: PipeReadEnd,
    guard: CloseGuard,
}

impl PipeReader {
    pub(crate) fn new(inner: PipeReadEnd, shared: Arc<Shared>) -> Self {
        Self {
            inner,
            guard: CloseGuard::new(shared),
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before {
                    this.guard.complete();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.guard.complete();
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Writable adapter for the child's stdin.
pub struct PipeWriter {
    inner: PipeWriteEnd,
    guard: CloseGuard,
}

impl PipeWriter {
    pub(crate) fn new(inner: PipeWriteEnd, shared: Arc<Shared>) -> Self {
        Self {
            inner,
            guard: CloseGuard::new(shared),
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Err(err)) => {
                this.guard.complete();
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.guard.complete();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
