use std::{net::SocketAddr, str::FromStr};

use http::{
    HeaderMap, HeaderValue, Method, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    uri::{Scheme, Uri},
};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Replay;

/// Host and port for an origin connection.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl Authority {
    /// Derives the dial target for a proxied request.
    ///
    /// Prefers the request URI authority (absolute-form and
    /// authority-form targets) and falls back to the `Host` value for
    /// origin-form requests. Without an explicit port, the scheme
    /// decides between 80 and 443.
    pub fn from_request(req: &RequestHead) -> io::Result<Self> {
        if let Some(authority) = req.uri.authority() {
            let port = match authority.port_u16() {
                Some(port) => port,
                None => default_port(req.uri.scheme()),
            };
            return Ok(Self {
                host: authority.host().to_string(),
                port,
            });
        }
        Self::from_host_value(&req.host, default_port(req.uri.scheme()))
    }

    /// Parses a `host[:port]` string such as a `Host` header value.
    pub fn from_host_value(value: &str, default_port: u16) -> io::Result<Self> {
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !port.contains(']') => {
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                (host, port)
            }
            _ => (value, default_port),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: Option<&Scheme>) -> u16 {
    match scheme {
        Some(scheme) if *scheme == Scheme::HTTPS => 443,
        _ => 80,
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// How the bytes following a header section are delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body follows.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// The body runs until the peer closes (responses only).
    UntilClose,
}

impl BodyFraming {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, BodyFraming::None)
    }

    fn from_headers(headers: &HeaderMap) -> io::Result<Self> {
        if header_has_token(headers, &TRANSFER_ENCODING, "chunked") {
            return Ok(Self::Chunked);
        }
        match headers.get(CONTENT_LENGTH) {
            None => Ok(Self::None),
            Some(value) => {
                let len = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| invalid("invalid Content-Length"))?;
                Ok(Self::Length(len))
            }
        }
    }
}

/// True when any value of `name` contains `token` in its comma-separated
/// list, compared case-insensitively.
pub(crate) fn header_has_token(
    headers: &HeaderMap,
    name: &http::header::HeaderName,
    token: &str,
) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Outcome of peeking for a request head without consuming it.
pub(crate) enum Peeked {
    /// A complete head section was parsed.
    Request(Box<RequestHead>),
    /// The buffer limit was reached before the head section ended.
    Overflow,
    /// The bytes do not parse as an HTTP request.
    Invalid,
}

/// Parsed request line and header section.
///
/// The body stays on the stream; [`body`](Self::body) records how it is
/// framed so the engine can forward or drain it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target. Authority-form for CONNECT, absolute-form for
    /// proxied requests, origin-form otherwise.
    pub uri: Uri,
    /// Protocol version from the request line.
    pub version: Version,
    /// Header map as received.
    pub headers: HeaderMap,
    /// Host value: the URI authority when present, else the `Host`
    /// header.
    pub host: String,
    /// Address of the downstream peer this request arrived on.
    pub remote_addr: Option<SocketAddr>,
    pub(crate) close: bool,
    pub(crate) body: BodyFraming,
}

impl RequestHead {
    /// Reads and parses a request head, consuming it from `reader`.
    ///
    /// Returns `None` on a clean end of stream before any bytes.
    pub(crate) async fn read(
        reader: &mut Replay<impl AsyncRead + Unpin>,
    ) -> io::Result<Option<Self>> {
        loop {
            if let Some((len, head)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(Some(head));
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of request header section",
                ));
            }
            if reader.buffer_more().await? == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside request header section",
                ));
            }
        }
    }

    /// Peeks for a request head without removing it from `reader`.
    ///
    /// Unlike [`read`](Self::read), malformed bytes are reported as
    /// [`Peeked::Invalid`] rather than an error so the caller can fall
    /// back to piping the buffered bytes verbatim.
    pub(crate) async fn peek(reader: &mut Replay<impl AsyncRead + Unpin>) -> io::Result<Peeked> {
        loop {
            match Self::parse_with_len(reader.buffer()) {
                Ok(Some((_, head))) => return Ok(Peeked::Request(Box::new(head))),
                Ok(None) => {}
                Err(_) => return Ok(Peeked::Invalid),
            }
            if reader.is_full() {
                return Ok(Peeked::Overflow);
            }
            if reader.buffer_more().await? == 0 {
                return Ok(Peeked::Invalid);
            }
        }
    }

    /// Parses a request head from a buffer, returning `None` when
    /// incomplete. On success also returns the header section length.
    pub(crate) fn parse_with_len(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).map_err(|_| invalid("invalid HTTP request"))? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let head = Self::from_parsed(req)?;
                Ok(Some((header_len, head)))
            }
        }
    }

    fn from_parsed(req: httparse::Request<'_, '_>) -> io::Result<Self> {
        let method = req
            .method
            .ok_or_else(|| invalid("missing HTTP method"))?
            .parse::<Method>()
            .map_err(|_| invalid("invalid HTTP method"))?;
        let target = req.path.ok_or_else(|| invalid("missing request target"))?;
        let uri = Uri::from_str(target).map_err(|_| invalid("invalid request target"))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        let host = match uri.authority() {
            Some(authority) => authority.to_string(),
            None => headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        };
        let close = wants_close(version, &headers);
        let body = if method == Method::CONNECT {
            BodyFraming::None
        } else {
            BodyFraming::from_headers(&headers)?
        };
        Ok(Self {
            method,
            uri,
            version,
            headers,
            host,
            remote_addr: None,
            close,
            body,
        })
    }

    /// Writes the head section in origin-form, as sent to an origin
    /// server.
    pub(crate) async fn write_to(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        writer
            .write_all(format!("{} {} HTTP/1.1\r\n", self.method, target).as_bytes())
            .await?;
        write_headers(&self.headers, writer).await?;
        writer.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Whether the client asked to close the connection after this
    /// request.
    pub fn is_close(&self) -> bool {
        self.close
    }
}

/// Parsed response status line and header section.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code from the status line.
    pub status: StatusCode,
    /// Protocol version from the status line.
    pub version: Version,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Header map as received.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Creates a head with the given status and no headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// Reads and parses a response head, consuming it from `reader`.
    pub(crate) async fn read(
        reader: &mut Replay<impl AsyncRead + Unpin>,
    ) -> io::Result<Self> {
        loop {
            if let Some((len, head)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(head);
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "buffer limit reached before end of response header section",
                ));
            }
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside response header section",
                ));
            }
        }
    }

    /// Parses a response head from a buffer, returning `None` when
    /// incomplete. On success also returns the header section length.
    pub(crate) fn parse_with_len(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).map_err(|_| invalid("invalid HTTP response"))? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.ok_or_else(|| invalid("missing status code"))?;
                let status =
                    StatusCode::from_u16(code).map_err(|_| invalid("invalid status code"))?;
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        version,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// How the body following this head is framed, given the request
    /// method it answers.
    pub(crate) fn body_framing(&self, req_method: &Method) -> io::Result<BodyFraming> {
        if *req_method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::None);
        }
        match BodyFraming::from_headers(&self.headers)? {
            BodyFraming::None => Ok(BodyFraming::UntilClose),
            framing => Ok(framing),
        }
    }

    /// Whether this response terminates the upstream connection.
    pub(crate) fn wants_close(&self) -> bool {
        wants_close(self.version, &self.headers)
    }

    /// Returns the reason phrase or the canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Writes the status line and header section.
    pub(crate) async fn write_to(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        writer
            .write_all(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes())
            .await?;
        write_headers(&self.headers, writer).await?;
        writer.write_all(b"\r\n").await?;
        Ok(())
    }
}

fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    if header_has_token(headers, &CONNECTION, "close") {
        return true;
    }
    version < Version::HTTP_11 && !header_has_token(headers, &CONNECTION, "keep-alive")
}

async fn write_headers(
    headers: &HeaderMap,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<()> {
    for (name, value) in headers.iter() {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_request(raw: &[u8]) -> RequestHead {
        RequestHead::parse_with_len(raw).unwrap().unwrap().1
    }

    #[test]
    fn parses_absolute_form_request() {
        let head = parse_request(b"GET http://example.com/p?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.host, "example.com");
        assert_eq!(head.uri.path(), "/p");
        assert!(!head.is_close());
        assert!(head.body.is_none());
    }

    #[test]
    fn parses_connect_request() {
        let head = parse_request(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n");
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.host, "example.com:443");
        assert_eq!(head.uri.authority().unwrap().as_str(), "example.com:443");
    }

    #[test]
    fn http_10_defaults_to_close() {
        let head = parse_request(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
        assert_eq!(head.version, Version::HTTP_10);
        assert!(head.is_close());

        let head = parse_request(b"GET / HTTP/1.0\r\nHost: h\r\nConnection: keep-alive\r\n\r\n");
        assert!(!head.is_close());
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let head = parse_request(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(head.body, BodyFraming::Chunked);
    }

    #[test]
    fn dial_authority_defaults_ports_by_scheme() {
        let head = parse_request(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let authority = Authority::from_request(&head).unwrap();
        assert_eq!(authority.to_addr(), "example.com:80");

        let head = parse_request(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        let authority = Authority::from_request(&head).unwrap();
        assert_eq!(authority.to_addr(), "example.com:8080");
    }

    #[test]
    fn response_framing_for_head_and_304() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let head = ResponseHead::parse_with_len(raw).unwrap().unwrap().1;
        assert_eq!(
            head.body_framing(&Method::HEAD).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            head.body_framing(&Method::GET).unwrap(),
            BodyFraming::Length(10)
        );

        let raw = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        let head = ResponseHead::parse_with_len(raw).unwrap().unwrap().1;
        assert_eq!(head.body_framing(&Method::GET).unwrap(), BodyFraming::None);
    }

    #[test]
    fn response_without_length_is_close_delimited() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        let head = ResponseHead::parse_with_len(raw).unwrap().unwrap().1;
        assert_eq!(
            head.body_framing(&Method::GET).unwrap(),
            BodyFraming::UntilClose
        );
    }
}
