//! Header hygiene for proxied requests and responses.

use http::{
    HeaderMap, HeaderValue, Version,
    header::{CONNECTION, DATE, HOST, HeaderName, USER_AGENT},
    uri::Uri,
};

use crate::parse::{RequestHead, ResponseHead};

/// Hop-by-hop headers per RFC 2616 section 13.5.1. Tokens named in the
/// `Connection` header are stripped in addition to this set.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailers"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

/// Copies `src` into a fresh header map, dropping hop-by-hop headers and
/// every token the incoming `Connection` header names.
pub(crate) fn copy_forwarding_headers(src: &HeaderMap) -> HeaderMap {
    let connection_tokens: Vec<String> = src
        .get_all(CONNECTION)
        .iter()
        .flat_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if HOP_BY_HOP_HEADERS.contains(name) {
            continue;
        }
        if connection_tokens.iter().any(|t| t.as_str() == name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}

/// Prepares a request for forwarding to an origin.
///
/// The copy speaks HTTP/1.1 and keeps the origin connection alive
/// regardless of what the client asked for; the client's close intent is
/// honored on the downstream side by the request loop instead.
pub(crate) fn prepare_request(mut req: RequestHead) -> RequestHead {
    req.version = Version::HTTP_11;
    req.close = false;

    req.headers = copy_forwarding_headers(&req.headers);
    // Restore the Host header; servers routinely strip it from the
    // stored request while parsing.
    if let Ok(host) = HeaderValue::from_str(&req.host) {
        req.headers.insert(HOST, host);
    }

    req.uri = rebuild_uri(&req.uri, &req.host);

    // User-Agent is either meaningful or absent, never empty. An empty
    // value means the client explicitly sent none; deleting it keeps
    // any downstream HTTP layer from injecting a default.
    match req.headers.get(USER_AGENT).cloned() {
        Some(value) if value.is_empty() => {
            req.headers.remove(USER_AGENT);
        }
        Some(value) => {
            req.headers.insert(USER_AGENT, value);
        }
        None => {}
    }

    req
}

/// Rebuilds the request URI around the request host, preserving any
/// userinfo the original authority carried. An absent scheme means the
/// request reached us in origin-form over plain HTTP.
fn rebuild_uri(uri: &Uri, host: &str) -> Uri {
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = match uri
        .authority()
        .and_then(|a| a.as_str().rsplit_once('@'))
        .map(|(userinfo, _)| userinfo)
    {
        Some(userinfo) => format!("{userinfo}@{host}"),
        None => host.to_string(),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| uri.clone())
}

/// Prepares a response for forwarding to the client.
///
/// `below_http11` marks clients that cannot parse chunked framing; the
/// request loop de-chunks the body for them, so the header must not
/// advertise it.
pub(crate) fn prepare_response(resp: &mut ResponseHead, below_http11: bool) {
    resp.headers = copy_forwarding_headers(&resp.headers);
    if !resp.headers.contains_key(DATE) {
        let now = chrono::Utc::now().format("%A, %d-%b-%y %H:%M:%S GMT");
        if let Ok(value) = HeaderValue::from_str(&now.to_string()) {
            resp.headers.insert(DATE, value);
        }
    }
    if below_http11 {
        resp.headers.remove(http::header::TRANSFER_ENCODING);
    }
}
