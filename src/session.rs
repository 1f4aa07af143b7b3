//! Per-connection session state and the request loop.

use std::net::SocketAddr;

use http::{
    HeaderValue, Method, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    uri,
};
use n0_error::e;
use tokio::io::{self, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::{
    HEADER_SECTION_MAX_LENGTH, ProxyError,
    conn::{BoxConn, PrefixedConn, ProxyConn},
    error::is_unexpected,
    filter::{Next, Response, ResponseBody, Terminal},
    headers::prepare_response,
    parse::{BodyFraming, RequestHead},
    proxy::{ErrorResponder, Proxy},
    transport::ForwardTransport,
    util::{Replay, TeeWriter, copy_body, drain_body},
};

/// Reader half of the downstream connection with replayable buffering.
pub(crate) type SessionReader = Replay<ReadHalf<BoxConn>>;

type SessionWriter = WriteHalf<BoxConn>;

/// Upper bound on what the per-connection wire log retains.
const WIRE_LOG_CAP: usize = 512;

/// State carried across all requests of one downstream connection.
///
/// Filters receive the session alongside each request; the engine keeps
/// the original target captured from the first request here so that
/// origin-form keep-alive requests can be backfilled, and records the
/// CONNECT handoff decision for the request loop to act on.
pub struct Session {
    pub(crate) remote_addr: Option<SocketAddr>,
    request_index: u64,
    original: Option<OriginalTarget>,
    pub(crate) connect: ConnectState,
    pub(crate) suppress_ok: bool,
    body_consumed: bool,
    pub(crate) wire_log: Vec<u8>,
}

/// Target information captured from the first request on a connection.
/// Later keep-alive requests often arrive in origin-form without scheme
/// or host; these values fill the gaps.
struct OriginalTarget {
    scheme: Option<uri::Scheme>,
    authority: Option<uri::Authority>,
    host: String,
}

/// Pending CONNECT handoff.
///
/// Once an authority (or a dialed connection) is recorded here, the
/// current request is a CONNECT and the request loop hands the
/// connection to the tunnel phase after this iteration.
pub(crate) enum ConnectState {
    Idle,
    /// The tunnel target is known; dialing is deferred to the tunnel
    /// phase (eager-OK mode).
    Pending { authority: String },
    /// The origin was dialed before acknowledging the tunnel
    /// (wait-for-upstream mode).
    Established {
        authority: String,
        upstream: BoxConn,
    },
}

impl ConnectState {
    pub(crate) fn is_active(&self) -> bool {
        !matches!(self, ConnectState::Idle)
    }
}

impl Session {
    pub(crate) fn new(suppress_ok: bool) -> Self {
        Self {
            remote_addr: None,
            request_index: 0,
            original: None,
            connect: ConnectState::Idle,
            suppress_ok,
            body_consumed: true,
            wire_log: Vec::new(),
        }
    }

    /// Address of the downstream peer, fixed for the whole connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Zero-based sequence number of the request currently processed.
    pub fn request_index(&self) -> u64 {
        self.request_index
    }

    /// Called by the forward transport once it has streamed the request
    /// body to the origin.
    pub(crate) fn mark_request_body_consumed(&mut self) {
        self.body_consumed = true;
    }

    /// Takes the pending CONNECT handoff, resetting the state.
    pub(crate) fn take_connect(&mut self) -> Option<(String, Option<BoxConn>)> {
        match std::mem::replace(&mut self.connect, ConnectState::Idle) {
            ConnectState::Idle => None,
            ConnectState::Pending { authority } => Some((authority, None)),
            ConnectState::Established {
                authority,
                upstream,
            } => Some((authority, Some(upstream))),
        }
    }

    fn capture_original(&mut self, req: &RequestHead) {
        if self.original.is_some() {
            return;
        }
        self.original = Some(OriginalTarget {
            scheme: req.uri.scheme().cloned(),
            authority: req.uri.authority().cloned(),
            host: req.host.clone(),
        });
    }

    fn backfill(&self, req: &mut RequestHead) {
        let Some(orig) = &self.original else {
            return;
        };
        if req.uri.scheme().is_none() || req.uri.authority().is_none() {
            let mut parts = req.uri.clone().into_parts();
            if parts.scheme.is_none() {
                parts.scheme = orig.scheme.clone();
            }
            if parts.authority.is_none() {
                parts.authority = orig.authority.clone();
            }
            if let Ok(uri) = Uri::from_parts(parts) {
                req.uri = uri;
            }
        }
        if req.host.is_empty() {
            req.host = orig.host.clone();
        }
    }
}

impl Proxy {
    /// Runs the request loop over one downstream connection.
    ///
    /// `upstream`, when present, is an already-connected origin stream
    /// (a MITM'd CONNECT falling back to HTTP) that every forwarded
    /// request on this connection reuses.
    pub(crate) async fn run_session(
        &self,
        session: &mut Session,
        conn: BoxConn,
        upstream: Option<Replay<BoxConn>>,
    ) -> Result<(), ProxyError> {
        if session.remote_addr.is_none() {
            session.remote_addr = conn.peer_addr();
        }
        let (read_half, mut writer) = io::split(conn);
        let mut reader: SessionReader = Replay::new(read_half, HEADER_SECTION_MAX_LENGTH);
        let mut transport = match upstream {
            Some(up) => ForwardTransport::with_upstream(self.dialer.clone(), up),
            None => ForwardTransport::new(self.dialer.clone(), self.idle_timeout),
        };

        let mut req = match RequestHead::read(&mut reader).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(err) => {
                return self
                    .read_failed(session, &mut writer, &mut transport, err, None)
                    .await;
            }
        };

        let mut last_err: Option<ProxyError> = None;
        loop {
            req.remote_addr = session.remote_addr;
            session.capture_original(&req);
            session.backfill(&mut req);
            session.body_consumed = req.body.is_none();
            let req_copy = req.clone();

            let chain_result = {
                let terminal = if req.method == Method::CONNECT {
                    Terminal::Connect(self)
                } else {
                    Terminal::Forward(&mut transport, &mut reader)
                };
                let next = Next {
                    filters: &self.filters,
                    terminal,
                };
                next.run(session, req).await
            };
            // Reassigned on every pass so the session result reflects
            // only the most recent request's outcome.
            let resp = match chain_result {
                Ok(resp) => {
                    last_err = None;
                    resp
                }
                Err(err) => {
                    debug!("filter chain failed: {err:#}");
                    let resp = self
                        .on_error
                        .on_error(session, Some(&req_copy), false, &err)
                        .await;
                    last_err = Some(err);
                    resp
                }
            };

            let mut resp_close = false;
            if let Some(resp) = resp {
                match self
                    .write_response(&mut writer, session, &mut transport, Some(&req_copy), resp)
                    .await
                {
                    Ok(close) => resp_close = close,
                    Err(err) if is_unexpected(&err) => {
                        return Err(e!(ProxyError::WriteResponse, err.into()));
                    }
                    Err(_) => return finish(last_err),
                }
            }

            if session.connect.is_active() {
                // Splice bytes already buffered past the request head
                // back onto the connection so the tunnel sees them.
                let (leftover, read_half) = reader.into_parts();
                let conn = read_half.unsplit(writer);
                let conn: BoxConn = if leftover.is_empty() {
                    conn
                } else {
                    trace!(spliced = leftover.len(), "splicing buffered bytes into tunnel");
                    Box::new(PrefixedConn::new(leftover, conn))
                };
                drop(transport);
                return self.proceed_with_connect(session, conn).await;
            }

            if req_copy.is_close() {
                return finish(last_err);
            }
            if last_err.is_none() && resp_close {
                return Ok(());
            }

            if !session.body_consumed && !req_copy.body.is_none() {
                if let Err(err) = drain_body(&req_copy.body, &mut reader).await {
                    if is_unexpected(&err) {
                        return Err(e!(ProxyError::Io, err.into()));
                    }
                    return finish(last_err);
                }
            }

            req = match RequestHead::read(&mut reader).await {
                Ok(Some(req)) => req,
                Ok(None) => return finish(last_err),
                Err(err) => {
                    return self
                        .read_failed(session, &mut writer, &mut transport, err, last_err)
                        .await;
                }
            };
            session.request_index += 1;
        }
    }

    /// Handles a request parse failure: expected terminations end the
    /// session silently, anything else consults the error responder and
    /// surfaces.
    async fn read_failed(
        &self,
        session: &mut Session,
        writer: &mut SessionWriter,
        transport: &mut ForwardTransport,
        err: io::Error,
        last_err: Option<ProxyError>,
    ) -> Result<(), ProxyError> {
        if !is_unexpected(&err) {
            trace!("downstream closed: {err}");
            return finish(last_err);
        }
        let err = e!(ProxyError::ReadRequest, err.into());
        if let Some(resp) = self.on_error.on_error(session, None, true, &err).await {
            self.write_response(writer, session, transport, None, resp)
                .await
                .ok();
        }
        Err(err)
    }

    /// Writes a response downstream through the wire-log tee.
    ///
    /// Returns whether the response asked for the downstream connection
    /// to be closed. Responses below status 200 headed to a client below
    /// HTTP/1.1 are discarded (their body is still drained so the origin
    /// connection survives).
    pub(crate) async fn write_response(
        &self,
        writer: &mut SessionWriter,
        session: &mut Session,
        transport: &mut ForwardTransport,
        req: Option<&RequestHead>,
        mut resp: Response,
    ) -> io::Result<bool> {
        let below_http11 = req.map(|r| r.version < Version::HTTP_11).unwrap_or(false);

        if below_http11 && resp.head.status.as_u16() < 200 {
            // HTTP/1.0 does not define status codes below 200.
            if let ResponseBody::Upstream(mut body) = resp.body {
                drain_body(&body.framing, &mut body.conn).await?;
                transport.recycle(body);
            }
            return Ok(false);
        }

        prepare_response(&mut resp.head, below_http11);
        let mut close = resp.close;
        let mut dechunk = false;
        match &resp.body {
            ResponseBody::Empty => {
                if !resp.head.status.is_informational() {
                    resp.head
                        .headers
                        .entry(CONTENT_LENGTH)
                        .or_insert(HeaderValue::from_static("0"));
                }
            }
            ResponseBody::Full(bytes) => {
                resp.head
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            ResponseBody::Upstream(body) => match body.framing {
                BodyFraming::Chunked if below_http11 => {
                    // Framing was stripped by hygiene; without a length
                    // the body must be close-delimited.
                    dechunk = true;
                    close = true;
                }
                BodyFraming::Chunked => {
                    resp.head
                        .headers
                        .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }
                BodyFraming::UntilClose => close = true,
                BodyFraming::Length(_) | BodyFraming::None => {}
            },
        }
        if close {
            resp.head
                .headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        } else if let Some(timeout) = self.idle_timeout {
            // Advertise how long we keep idle connections around.
            let value = format!("timeout={}", timeout.as_secs());
            if let Ok(value) = HeaderValue::from_str(&value) {
                resp.head.headers.insert("keep-alive", value);
            }
        }

        let mut tee = TeeWriter::new(writer, &mut session.wire_log, WIRE_LOG_CAP);
        resp.head.write_to(&mut tee).await?;
        match resp.body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => tee.write_all(&bytes).await?,
            ResponseBody::Upstream(mut body) => {
                copy_body(&body.framing, &mut body.conn, &mut tee, dechunk).await?;
                transport.recycle(body);
            }
        }
        tee.flush().await?;
        Ok(close)
    }
}

fn finish(last_err: Option<ProxyError>) -> Result<(), ProxyError> {
    match last_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
