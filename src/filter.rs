//! Composable request filters and the chain walker.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::{HeaderValue, StatusCode, header::CONTENT_TYPE};

use crate::{
    ProxyError,
    parse::{RequestHead, ResponseHead},
    proxy::Proxy,
    session::{Session, SessionReader},
    transport::{ForwardTransport, UpstreamBody},
};

/// A step in the proxy's request processing chain.
///
/// A filter may forward the (possibly modified) request by awaiting
/// `next`, short-circuit by returning a synthesized [`Response`] without
/// calling `next`, or post-process the response `next` produced.
/// Returning `Ok(None)` writes nothing downstream; returning an error
/// hands the request to the proxy's error responder.
#[dynosaur(pub(crate) DynFilter = dyn(box) Filter)]
pub trait Filter: Send + Sync {
    fn apply<'a>(
        &'a self,
        session: &'a mut Session,
        req: RequestHead,
        next: Next<'a>,
    ) -> impl Future<Output = Result<Option<Response>, ProxyError>> + Send + 'a;
}

/// The rest of the filter chain, ending in the terminal step: the
/// forward transport for plain requests or the CONNECT handler for
/// tunnels.
pub struct Next<'a> {
    pub(crate) filters: &'a [Arc<DynFilter<'static>>],
    pub(crate) terminal: Terminal<'a>,
}

pub(crate) enum Terminal<'a> {
    Forward(&'a mut ForwardTransport, &'a mut SessionReader),
    Connect(&'a Proxy),
}

impl<'a> Next<'a> {
    /// Runs the remaining filters and the terminal step.
    pub async fn run(
        self,
        session: &mut Session,
        req: RequestHead,
    ) -> Result<Option<Response>, ProxyError> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                let next = Next {
                    filters: rest,
                    terminal: self.terminal,
                };
                filter.apply(session, req, next).await
            }
            None => match self.terminal {
                Terminal::Forward(transport, reader) => {
                    transport.round_trip(session, req, reader).await
                }
                Terminal::Connect(proxy) => proxy.connect_terminal(session, req).await,
            },
        }
    }
}

/// Response flowing back through the filter chain toward the client.
///
/// Responses either carry a body read from the origin (produced by the
/// terminal step) or a synthesized in-memory body.
#[derive(derive_more::Debug)]
pub struct Response {
    /// Status line and headers.
    pub head: ResponseHead,
    #[debug(skip)]
    pub(crate) body: ResponseBody,
    pub(crate) close: bool,
}

pub(crate) enum ResponseBody {
    Empty,
    Full(Bytes),
    Upstream(UpstreamBody),
}

impl Response {
    /// Synthesizes a response with the given status and no body.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            head: ResponseHead::new(status),
            body: ResponseBody::Empty,
            close: false,
        }
    }

    /// Synthesizes a `text/plain` response.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut head = ResponseHead::new(status);
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Self {
            head,
            body: ResponseBody::Full(body.into()),
            close: false,
        }
    }

    pub(crate) fn upstream(head: ResponseHead, body: UpstreamBody, close: bool) -> Self {
        Self {
            head,
            body: ResponseBody::Upstream(body),
            close,
        }
    }

    /// Marks the downstream connection to be closed after this
    /// response.
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Whether writing this response ends the downstream connection.
    pub fn is_close(&self) -> bool {
        self.close
    }
}

/// Outermost passthrough installed when an idle timeout is configured.
///
/// The timeout itself only governs idle origin connections; the forward
/// transport drops stale idle connections on checkout. Active transfers
/// are never cut short here.
pub(crate) struct IdleTimeoutFilter;

impl Filter for IdleTimeoutFilter {
    async fn apply<'a>(
        &'a self,
        session: &'a mut Session,
        req: RequestHead,
        next: Next<'a>,
    ) -> Result<Option<Response>, ProxyError> {
        next.run(session, req).await
    }
}
