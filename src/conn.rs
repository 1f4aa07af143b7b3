//! Connection abstraction and connection-aware wrapper hooks.

use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::{ProxyError, RequestHead, ResponseHead};

/// Byte stream the engine proxies over.
///
/// Implementations can wrap other connections in layers (TLS, counting,
/// throttling). The engine walks such chains through
/// [`wrapped`](Self::wrapped) and dispatches to whichever layers expose
/// the [`RequestAware`] / [`ResponseAware`] capabilities.
pub trait ProxyConn: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Address of the remote peer, when known.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// The next connection down the wrapper chain, if this is a
    /// wrapper.
    fn wrapped(&self) -> Option<&dyn ProxyConn> {
        None
    }

    /// Capability accessor for request observation.
    fn as_request_aware(&self) -> Option<&dyn RequestAware> {
        None
    }

    /// Capability accessor for response observation.
    fn as_response_aware(&self) -> Option<&dyn ResponseAware> {
        None
    }
}

/// Owned, type-erased [`ProxyConn`].
pub type BoxConn = Box<dyn ProxyConn>;

impl ProxyConn for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl<T: ProxyConn + ?Sized> ProxyConn for Box<T> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn wrapped(&self) -> Option<&dyn ProxyConn> {
        (**self).wrapped()
    }

    fn as_request_aware(&self) -> Option<&dyn RequestAware> {
        (**self).as_request_aware()
    }

    fn as_response_aware(&self) -> Option<&dyn ResponseAware> {
        (**self).as_response_aware()
    }
}

/// Connection layer that observes requests before they are sent
/// upstream.
///
/// Observation only: implementations must not alter the request.
pub trait RequestAware: Send + Sync {
    fn on_request(&self, req: &RequestHead);
}

/// Connection layer that observes the outcome of each upstream
/// exchange, including failed ones.
pub trait ResponseAware: Send + Sync {
    fn on_response(&self, req: &RequestHead, result: Result<&ResponseHead, &ProxyError>);
}

/// Notifies every request-aware layer in the wrapper chain.
pub(crate) fn notify_request(conn: &dyn ProxyConn, req: &RequestHead) {
    walk_layers(conn, &mut |layer| {
        if let Some(aware) = layer.as_request_aware() {
            aware.on_request(req);
        }
    });
}

/// Notifies every response-aware layer in the wrapper chain.
pub(crate) fn notify_response(
    conn: &dyn ProxyConn,
    req: &RequestHead,
    result: Result<&ResponseHead, &ProxyError>,
) {
    walk_layers(conn, &mut |layer| {
        if let Some(aware) = layer.as_response_aware() {
            aware.on_response(req, result);
        }
    });
}

fn walk_layers(conn: &dyn ProxyConn, f: &mut impl FnMut(&dyn ProxyConn)) {
    let mut current = Some(conn);
    while let Some(layer) = current {
        f(layer);
        current = layer.wrapped();
    }
}

/// Connection with buffered bytes spliced back in front of its read
/// side.
///
/// Used to hand a CONNECT tunnel (or a MITM re-entry) any bytes the
/// request loop had already buffered past the request head, and to
/// prepend a synthesized CONNECT request for the [`Proxy::connect`]
/// entrypoint.
///
/// [`Proxy::connect`]: crate::Proxy::connect
pub struct PrefixedConn {
    prefix: Bytes,
    inner: BoxConn,
}

impl PrefixedConn {
    pub fn new(prefix: impl Into<Bytes>, inner: BoxConn) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl AsyncRead for PrefixedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            let chunk = this.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl ProxyConn for PrefixedConn {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn wrapped(&self) -> Option<&dyn ProxyConn> {
        Some(self.inner.as_ref())
    }
}
