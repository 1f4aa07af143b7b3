//! CONNECT handling: tunnel acknowledgement, MITM interception, and the
//! raw pipe phase.

use bytes::Bytes;
use http::StatusCode;
use n0_error::{anyerr, e};
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH, ProxyError,
    conn::{BoxConn, PrefixedConn},
    error::is_unexpected,
    filter::Response,
    parse::{Peeked, RequestHead},
    proxy::{Dialer, MitmInterceptor, Proxy},
    session::{ConnectState, Session},
    util::{Replay, pipe},
};

impl Proxy {
    /// Terminal step of the filter chain for CONNECT requests.
    ///
    /// Records the tunnel target on the session, which makes the
    /// request loop hand off to [`proceed_with_connect`] after this
    /// iteration, and synthesizes the `200` acknowledgement. In
    /// eager-OK mode the OK goes out before any dial attempt, so user
    /// agents never blame the proxy for an unreachable origin. In
    /// wait-for-upstream mode the origin is dialed first and a dial
    /// failure turns into `502 Bad Gateway` with no OK at all.
    ///
    /// [`proceed_with_connect`]: Proxy::proceed_with_connect
    pub(crate) async fn connect_terminal(
        &self,
        session: &mut Session,
        req: RequestHead,
    ) -> Result<Option<Response>, ProxyError> {
        // The target comes from the request URI, not the Host header;
        // the two may disagree about the port.
        let authority = req
            .uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.host.clone());

        if !self.ok_waits_for_upstream {
            session.connect = ConnectState::Pending { authority };
            return Ok(self.connect_ok(session));
        }

        match self.dialer.dial(true, &authority).await {
            Err(err) => {
                warn!(%authority, "failed to dial origin for CONNECT: {err}");
                Ok(Some(
                    Response::text(StatusCode::BAD_GATEWAY, "502 Bad Gateway").close(),
                ))
            }
            Ok(upstream) => {
                session.connect = ConnectState::Established {
                    authority,
                    upstream,
                };
                Ok(self.connect_ok(session))
            }
        }
    }

    fn connect_ok(&self, session: &Session) -> Option<Response> {
        if session.suppress_ok {
            None
        } else {
            Some(Response::from_status(StatusCode::OK))
        }
    }

    /// Tunnel phase entered by the request loop once a CONNECT handoff
    /// is recorded.
    ///
    /// Dials the origin if the CONNECT handler has not already, gives a
    /// configured MITM interceptor the chance to interpose, and then
    /// either re-enters the request loop over the decrypted stream or
    /// pipes raw bytes until one side closes.
    pub(crate) async fn proceed_with_connect(
        &self,
        session: &mut Session,
        downstream: BoxConn,
    ) -> Result<(), ProxyError> {
        let Some((authority, upstream)) = session.take_connect() else {
            return Ok(());
        };
        let mut upstream: BoxConn = match upstream {
            Some(conn) => conn,
            None => self
                .dialer
                .dial(true, &authority)
                .await
                .map_err(|err| e!(ProxyError::Dial, anyerr!(err)))?,
        };
        let mut downstream = downstream;
        let mut replay: Option<Bytes> = None;

        if let Some(mitm) = &self.mitm {
            let outcome = mitm
                .mitm(downstream, upstream)
                .await
                .map_err(|err| e!(ProxyError::Mitm, err))?;
            downstream = outcome.downstream;
            upstream = outcome.upstream;

            if outcome.mitming {
                // Try to read an HTTP request from the decrypted stream,
                // assuming heads fit the replay bound. If one parses,
                // the tunnel continues as plain HTTP.
                let mut peeker = Replay::new(downstream, HEADER_SECTION_MAX_LENGTH);
                match RequestHead::peek(&mut peeker).await {
                    Err(err) => {
                        if is_unexpected(&err) {
                            return Err(e!(ProxyError::Tunnel, err.into()));
                        }
                        return Ok(());
                    }
                    Ok(Peeked::Request(head)) => {
                        debug!(method = %head.method, "HTTP detected inside MITM'd tunnel");
                        let (buffered, conn) = peeker.into_parts();
                        let downstream: BoxConn = Box::new(PrefixedConn::new(buffered, conn));
                        let upstream = Replay::new(upstream, HEADER_SECTION_MAX_LENGTH);
                        return Box::pin(self.run_session(session, downstream, Some(upstream)))
                            .await;
                    }
                    Ok(Peeked::Overflow) => {
                        return Err(e!(
                            ProxyError::Mitm,
                            anyerr!("request inside MITM'd tunnel exceeds the replay buffer")
                        ));
                    }
                    Ok(Peeked::Invalid) => {
                        debug!("no HTTP inside MITM'd tunnel, falling back to pipe");
                        let (buffered, conn) = peeker.into_parts();
                        replay = (!buffered.is_empty()).then_some(buffered);
                        downstream = conn;
                    }
                }
            }
        }

        let mut buf_down = self.buffers.get();
        let mut buf_up = self.buffers.get();
        let result = self
            .pipe_tunnel(downstream, upstream, replay, &mut buf_down, &mut buf_up)
            .await;
        self.buffers.put(buf_down);
        self.buffers.put(buf_up);
        result
    }

    async fn pipe_tunnel(
        &self,
        downstream: BoxConn,
        mut upstream: BoxConn,
        replay: Option<Bytes>,
        buf_down: &mut [u8],
        buf_up: &mut [u8],
    ) -> Result<(), ProxyError> {
        if let Some(bytes) = replay {
            // The failed MITM peek consumed these bytes from the
            // downstream; they must reach the origin before piping
            // starts.
            upstream
                .write_all(&bytes)
                .await
                .map_err(|err| e!(ProxyError::Tunnel, err.into()))?;
        }

        let (mut down_recv, mut down_send) = io::split(downstream);
        let (mut up_recv, mut up_send) = io::split(upstream);
        let (down_to_up, up_to_down) = pipe(
            &mut down_recv,
            &mut down_send,
            &mut up_recv,
            &mut up_send,
            buf_down,
            buf_up,
        )
        .await;
        if let Err(err) = up_to_down {
            if is_unexpected(&err) {
                return Err(e!(ProxyError::Tunnel, err.into()));
            }
        }
        if let Err(err) = down_to_up {
            if is_unexpected(&err) {
                return Err(e!(ProxyError::Tunnel, err.into()));
            }
        }
        Ok(())
    }
}
