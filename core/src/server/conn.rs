//! Connection-level I/O deadlines.
//!
//! Accepted connections are wrapped so the configured read/write timeouts
//! bound how long a single read or write may stall. Progress resets the
//! deadline; an expired deadline surfaces as `TimedOut` and the connection
//! is torn down. Without configured timeouts the wrapper is pass-through.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use hyper::server::accept::Accept;
use hyper::server::conn::AddrIncoming;
use hyper::server::conn::AddrStream;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::time::Sleep;

use crate::error::AgentErr;

/// Listener adapter producing deadline-wrapped connections.
pub(crate) struct TimedIncoming {
    inner: AddrIncoming,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TimedIncoming {
    pub(crate) fn new(
        listener: std::net::TcpListener,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Self, AgentErr> {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let inner = AddrIncoming::from_listener(listener)
            .map_err(|error| AgentErr::Io(io::Error::other(error)))?;
        Ok(Self {
            inner,
            read_timeout,
            write_timeout,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

impl Accept for TimedIncoming {
    type Conn = TimedStream<AddrStream>;
    type Error = io::Error;

    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_accept(cx) {
            Poll::Ready(Some(Ok(stream))) => Poll::Ready(Some(Ok(TimedStream::new(
                stream,
                this.read_timeout,
                this.write_timeout,
            )))),
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An IO stream whose stalled reads and writes expire after the configured
/// timeouts.
pub(crate) struct TimedStream<S> {
    inner: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub(crate) fn new(
        inner: S,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

impl TimedStream<AddrStream> {
    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr()
    }
}

fn poll_deadline<T>(
    cx: &mut Context<'_>,
    timeout: Option<Duration>,
    slot: &mut Option<Pin<Box<Sleep>>>,
    message: &'static str,
) -> Poll<io::Result<T>> {
    let Some(limit) = timeout else {
        return Poll::Pending;
    };
    let deadline = slot.get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
    match deadline.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *slot = None;
            Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, message)))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(
                cx,
                this.read_timeout,
                &mut this.read_deadline,
                "connection read timed out",
            ),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(
                cx,
                this.write_timeout,
                &mut this.write_deadline,
                "connection write timed out",
            ),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(
                cx,
                this.write_timeout,
                &mut this.write_deadline,
                "connection write timed out",
            ),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
