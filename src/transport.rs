//! Per-downstream forward transport for plain (non-CONNECT) requests.

use std::{sync::Arc, time::Duration};

use http::StatusCode;
use n0_error::{anyerr, e};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    HEADER_SECTION_MAX_LENGTH, ProxyError,
    conn::{BoxConn, notify_request, notify_response},
    filter::Response,
    headers::prepare_request,
    parse::{Authority, BodyFraming, RequestHead, ResponseHead},
    proxy::{Dialer, DynDialer},
    session::{Session, SessionReader},
    util::{Replay, copy_body},
};

/// HTTP client bound to a single downstream connection.
///
/// Keeps at most one idle origin connection per host across keep-alive
/// requests. When created for a CONNECT that fell back to HTTP, it
/// instead holds a single already-established upstream that is always
/// reused and never pooled. All held connections are released when the
/// request loop exits and the transport is dropped.
pub(crate) struct ForwardTransport {
    dialer: Arc<DynDialer<'static>>,
    idle_timeout: Option<Duration>,
    /// Upstream handed over from a MITM'd CONNECT; reused for every
    /// request regardless of target, with idle pooling disabled.
    reused: Option<Replay<BoxConn>>,
    idle: Option<IdleSlot>,
}

struct IdleSlot {
    addr: String,
    conn: Replay<BoxConn>,
    parked: Instant,
}

/// Origin connection carrying an unread response body.
///
/// The request loop streams the body to the client and then hands the
/// connection back via [`ForwardTransport::recycle`].
pub(crate) struct UpstreamBody {
    pub(crate) conn: Replay<BoxConn>,
    pub(crate) framing: BodyFraming,
    addr: String,
    reused: bool,
    retain: bool,
}

impl ForwardTransport {
    pub(crate) fn new(dialer: Arc<DynDialer<'static>>, idle_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            idle_timeout,
            reused: None,
            idle: None,
        }
    }

    /// Transport that keeps using the supplied upstream connection.
    pub(crate) fn with_upstream(
        dialer: Arc<DynDialer<'static>>,
        upstream: Replay<BoxConn>,
    ) -> Self {
        Self {
            dialer,
            idle_timeout: None,
            reused: Some(upstream),
            idle: None,
        }
    }

    /// Performs one HTTP exchange with the origin.
    ///
    /// Applies header hygiene, fires the request-aware hooks before the
    /// request is written and the response-aware hooks after the
    /// exchange, and returns the response with its body still on the
    /// origin connection.
    pub(crate) async fn round_trip(
        &mut self,
        session: &mut Session,
        req: RequestHead,
        reader: &mut SessionReader,
    ) -> Result<Option<Response>, ProxyError> {
        let body_framing = req.body.clone();
        let prepared = prepare_request(req);
        let authority = Authority::from_request(&prepared)
            .map_err(|err| e!(ProxyError::Dial, err.into()))?;
        let addr = authority.to_addr();

        let (mut conn, reused) = self.checkout(&addr).await?;
        notify_request(conn.get_ref(), &prepared);

        let exchange = async {
            prepared.write_to(&mut conn).await?;
            copy_body(&body_framing, reader, &mut conn, false).await?;
            session.mark_request_body_consumed();
            conn.flush().await?;
            loop {
                let head = ResponseHead::read(&mut conn).await?;
                // Interim responses are not answers; pass over anything
                // informational except a protocol switch.
                if head.status.is_informational()
                    && head.status != StatusCode::SWITCHING_PROTOCOLS
                {
                    debug!(status = %head.status, "skipping interim response");
                    continue;
                }
                let framing = head.body_framing(&prepared.method)?;
                return Ok::<_, std::io::Error>((head, framing));
            }
        };

        let exchanged = exchange.await;
        match exchanged {
            Err(err) => {
                let err = e!(ProxyError::RoundTrip, err.into());
                notify_response(conn.get_ref(), &prepared, Err(&err));
                Err(err)
            }
            Ok((head, framing)) => {
                notify_response(conn.get_ref(), &prepared, Ok(&head));
                let close = head.wants_close()
                    || head.status == StatusCode::SWITCHING_PROTOCOLS
                    || framing == BodyFraming::UntilClose;
                let body = UpstreamBody {
                    conn,
                    framing,
                    addr,
                    reused,
                    retain: !close,
                };
                Ok(Some(Response::upstream(head, body, close)))
            }
        }
    }

    /// Takes a connection for `addr`: the handed-over upstream if this
    /// transport has one, else a fresh-enough idle connection, else a
    /// new dial.
    async fn checkout(&mut self, addr: &str) -> Result<(Replay<BoxConn>, bool), ProxyError> {
        if let Some(conn) = self.reused.take() {
            return Ok((conn, true));
        }
        if let Some(slot) = self.idle.take() {
            let stale = self
                .idle_timeout
                .is_some_and(|timeout| slot.parked.elapsed() > timeout);
            if slot.addr == addr && !stale {
                debug!(%addr, "reusing idle origin connection");
                return Ok((slot.conn, false));
            }
        }
        debug!(%addr, "dialing origin");
        let conn = self
            .dialer
            .dial(false, addr)
            .await
            .map_err(|err| e!(ProxyError::Dial, anyerr!(err)))?;
        Ok((Replay::new(conn, HEADER_SECTION_MAX_LENGTH), false))
    }

    /// Returns a connection once its response body has been fully
    /// relayed. The handed-over upstream is always kept; dialed
    /// connections are parked in the single idle slot unless the
    /// response ended the connection.
    pub(crate) fn recycle(&mut self, body: UpstreamBody) {
        if body.reused {
            self.reused = Some(body.conn);
        } else if body.retain {
            self.idle = Some(IdleSlot {
                addr: body.addr,
                conn: body.conn,
                parked: Instant::now(),
            });
        }
    }
}
