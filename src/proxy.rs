//! Proxy configuration and session entrypoints.

use std::{any::Any, future::Future, io, sync::Arc, time::Duration};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::StatusCode;
use n0_error::{AnyError, e};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    DEFAULT_BUFFER_LEN, ProxyError,
    conn::{BoxConn, PrefixedConn},
    filter::{DynFilter, Filter, IdleTimeoutFilter, Response},
    parse::RequestHead,
    session::Session,
};

/// Opens origin connections.
///
/// `is_connect` distinguishes CONNECT tunnel dials from plain request
/// forwarding, so implementations can apply different policy (timeouts,
/// routing, upstream chaining) per mode.
#[dynosaur(pub(crate) DynDialer = dyn(box) Dialer)]
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        is_connect: bool,
        addr: &'a str,
    ) -> impl Future<Output = io::Result<BoxConn>> + Send + 'a;
}

/// Default dialer: a plain TCP connection to the target address.
#[derive(Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial<'a>(&'a self, _is_connect: bool, addr: &'a str) -> io::Result<BoxConn> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

/// Synthesizes responses for failed requests.
///
/// `reading` is set when the failure happened while parsing a request
/// from the downstream, and clear when the filter chain failed without
/// producing a response. Returning `None` sends nothing.
#[dynosaur(pub(crate) DynErrorResponder = dyn(box) ErrorResponder)]
pub trait ErrorResponder: Send + Sync {
    fn on_error<'a>(
        &'a self,
        session: &'a Session,
        req: Option<&'a RequestHead>,
        reading: bool,
        err: &'a ProxyError,
    ) -> impl Future<Output = Option<Response>> + Send + 'a;
}

/// Error responder that never writes anything; sessions just end.
#[derive(Debug, Default)]
pub struct Silent;

impl ErrorResponder for Silent {
    async fn on_error<'a>(
        &'a self,
        _session: &'a Session,
        _req: Option<&'a RequestHead>,
        _reading: bool,
        _err: &'a ProxyError,
    ) -> Option<Response> {
        None
    }
}

/// Error responder emitting minimal `text/plain` status responses:
/// `400 Bad Request` for unparseable requests, `502 Bad Gateway` for
/// everything else.
#[derive(Debug, Default)]
pub struct StatusResponder;

impl ErrorResponder for StatusResponder {
    async fn on_error<'a>(
        &'a self,
        _session: &'a Session,
        _req: Option<&'a RequestHead>,
        reading: bool,
        _err: &'a ProxyError,
    ) -> Option<Response> {
        let status = if reading {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        let content = format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or(""));
        Some(Response::text(status, content).close())
    }
}

/// Attempts to interpose on a CONNECT tunnel.
///
/// Implementations may replace either endpoint (typically with TLS
/// wrappers minted from a local CA). When `mitming` is returned the
/// upstream endpoint must be ready for plaintext I/O, i.e. its TLS
/// handshake has been driven to completion; a handshake failure is
/// reported as an error and aborts the tunnel.
#[dynosaur(pub(crate) DynMitmInterceptor = dyn(box) MitmInterceptor)]
pub trait MitmInterceptor: Send + Sync {
    fn mitm<'a>(
        &'a self,
        downstream: BoxConn,
        upstream: BoxConn,
    ) -> impl Future<Output = Result<MitmOutcome, AnyError>> + Send + 'a;
}

/// Result of a MITM attempt: the (possibly replaced) endpoints and
/// whether TLS interception actually happened.
pub struct MitmOutcome {
    pub downstream: BoxConn,
    pub upstream: BoxConn,
    pub mitming: bool,
}

/// Source for the tunnel copy buffers.
///
/// Every `get` is matched by exactly one `put` on all exit paths, so
/// implementations can pool.
pub trait BufferSource: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

/// Buffer source that allocates fresh 64 KiB buffers and does not pool.
#[derive(Debug, Default)]
pub struct DefaultBufferSource;

impl BufferSource for DefaultBufferSource {
    fn get(&self) -> Vec<u8> {
        vec![0u8; DEFAULT_BUFFER_LEN]
    }

    fn put(&self, _buf: Vec<u8>) {}
}

/// Configuration for a [`Proxy`], immutable once built.
#[derive(Default)]
pub struct ProxyOpts {
    dialer: Option<Arc<DynDialer<'static>>>,
    filters: Vec<Arc<DynFilter<'static>>>,
    on_error: Option<Arc<DynErrorResponder<'static>>>,
    mitm: Option<Arc<DynMitmInterceptor<'static>>>,
    buffers: Option<Arc<dyn BufferSource>>,
    idle_timeout: Option<Duration>,
    ok_waits_for_upstream: bool,
}

impl ProxyOpts {
    /// Installs the dialer used for origin connections.
    ///
    /// Note: if not set, [`TcpDialer`] is used.
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(DynDialer::new_arc(dialer));
        self
    }

    /// Appends a filter to the chain. Filters run in the order they
    /// were added, outermost first.
    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(DynFilter::new_arc(filter));
        self
    }

    /// Installs the error responder consulted for failed requests.
    ///
    /// Note: if not set, failures produce no response ([`Silent`]).
    pub fn on_error(mut self, responder: impl ErrorResponder + 'static) -> Self {
        self.on_error = Some(DynErrorResponder::new_arc(responder));
        self
    }

    /// Installs a MITM interceptor for CONNECT tunnels.
    pub fn mitm(mut self, interceptor: impl MitmInterceptor + 'static) -> Self {
        self.mitm = Some(DynMitmInterceptor::new_arc(interceptor));
        self
    }

    /// Installs the source for tunnel copy buffers.
    pub fn buffer_source(mut self, buffers: impl BufferSource + 'static) -> Self {
        self.buffers = Some(Arc::new(buffers));
        self
    }

    /// Bounds how long idle origin connections are kept for reuse.
    /// Also advertises `Keep-Alive: timeout=...` on responses.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Makes CONNECT acknowledgements wait for a successful origin
    /// dial, answering `502 Bad Gateway` when the dial fails.
    ///
    /// Note: when left off (the default), CONNECT is acknowledged with
    /// `200` before any dial attempt so user agents attribute origin
    /// failures to the origin rather than the proxy.
    pub fn ok_waits_for_upstream(mut self, wait: bool) -> Self {
        self.ok_waits_for_upstream = wait;
        self
    }
}

/// The proxy connection engine.
///
/// Cheap to clone; all configuration is shared and immutable. Each
/// [`handle`](Self::handle) call runs one downstream connection's
/// request loop in its own task.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) dialer: Arc<DynDialer<'static>>,
    pub(crate) filters: Arc<[Arc<DynFilter<'static>>]>,
    pub(crate) on_error: Arc<DynErrorResponder<'static>>,
    pub(crate) mitm: Option<Arc<DynMitmInterceptor<'static>>>,
    pub(crate) buffers: Arc<dyn BufferSource>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) ok_waits_for_upstream: bool,
}

impl Proxy {
    pub fn new(opts: ProxyOpts) -> Self {
        let mut filters = opts.filters;
        if opts.idle_timeout.is_some() {
            filters.insert(0, DynFilter::new_arc(IdleTimeoutFilter));
        }
        Self {
            dialer: opts
                .dialer
                .unwrap_or_else(|| DynDialer::new_arc(TcpDialer)),
            filters: filters.into(),
            on_error: opts
                .on_error
                .unwrap_or_else(|| DynErrorResponder::new_arc(Silent)),
            mitm: opts.mitm,
            buffers: opts
                .buffers
                .unwrap_or_else(|| Arc::new(DefaultBufferSource)),
            idle_timeout: opts.idle_timeout,
            ok_waits_for_upstream: opts.ok_waits_for_upstream,
        }
    }

    /// Runs a session over a downstream client connection until the
    /// client closes, a response asks for close, or a CONNECT tunnel
    /// finishes.
    pub async fn handle(&self, conn: BoxConn) -> Result<(), ProxyError> {
        self.guarded_session(Bytes::new(), conn, false).await
    }

    /// Like [`handle`](Self::handle), with bytes already read off the
    /// connection spliced back in front of it.
    pub async fn handle_prebuffered(
        &self,
        initial: impl Into<Bytes>,
        conn: BoxConn,
    ) -> Result<(), ProxyError> {
        self.guarded_session(initial.into(), conn, false).await
    }

    /// Converts an already-connected stream into a proxy session by
    /// synthesizing a CONNECT to `origin` ahead of the input.
    ///
    /// Behaves exactly like a received CONNECT except that no `200`
    /// acknowledgement is written on the wire.
    pub async fn connect(
        &self,
        initial: impl Into<Bytes>,
        conn: BoxConn,
        origin: &str,
    ) -> Result<(), ProxyError> {
        let mut prefix =
            format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").into_bytes();
        prefix.extend_from_slice(&initial.into());
        self.guarded_session(prefix.into(), conn, true).await
    }

    /// Accepts connections from the listener and serves each in a new
    /// task. Runs until the listener errors or the task is cancelled.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id: u64 = 0;
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted connection");
                        if let Err(err) = proxy.handle(Box::new(stream)).await {
                            warn!("session ended with error: {err:#}");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    /// Runs the session in its own task so a panicking filter closes
    /// the downstream connection and surfaces as an error instead of
    /// unwinding into the caller.
    async fn guarded_session(
        &self,
        initial: Bytes,
        conn: BoxConn,
        suppress_ok: bool,
    ) -> Result<(), ProxyError> {
        let proxy = self.clone();
        let task = tokio::spawn(async move {
            let mut session = Session::new(suppress_ok);
            let conn: BoxConn = if initial.is_empty() {
                conn
            } else {
                Box::new(PrefixedConn::new(initial, conn))
            };
            let result = proxy.run_session(&mut session, conn, None).await;
            if !session.wire_log.is_empty() && session.wire_log.len() < 300 {
                debug!(
                    "responses wrote on the wire:\n***\n{}\n***",
                    String::from_utf8_lossy(&session.wire_log)
                );
            }
            result
        });
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                warn!(%message, "session task panicked");
                Err(e!(ProxyError::Panic { message }))
            }
            Err(_) => Err(e!(ProxyError::Panic {
                message: "session task cancelled".to_string()
            })),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
