//! Connection engine for an HTTP/HTTPS forward proxy.
//!
//! The engine multiplexes an HTTP/1.x request stream from a downstream
//! client, passes each request through a composable [`Filter`] chain,
//! forwards it to the origin, and upgrades `CONNECT` requests into
//! bidirectional byte tunnels. When a [`MitmInterceptor`] is installed,
//! tunneled TLS can be terminated at the proxy and the decrypted traffic
//! re-enters the request loop as plain HTTP.
//!
//! Certificate minting, dialing policy, and the filters themselves live
//! outside this crate; the engine consumes them through narrow traits.

mod conn;
mod connect;
mod error;
mod filter;
mod headers;
mod parse;
mod proxy;
mod session;
mod transport;
mod util;

pub use conn::{BoxConn, PrefixedConn, ProxyConn, RequestAware, ResponseAware};
pub use error::{ProxyError, is_unexpected};
pub use filter::{Filter, Next, Response};
pub use parse::{Authority, RequestHead, ResponseHead};
pub use proxy::{
    BufferSource, DefaultBufferSource, Dialer, ErrorResponder, MitmInterceptor, MitmOutcome,
    Proxy, ProxyOpts, Silent, StatusResponder, TcpDialer,
};
pub use session::Session;

/// How much data to buffer for a request or response header section
/// before it is considered invalid. This is also the replay bound for
/// peeking at decrypted traffic after a MITM'd CONNECT.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 65536;

/// Size of the buffers handed out by [`DefaultBufferSource`] for tunnel
/// copying.
pub(crate) const DEFAULT_BUFFER_LEN: usize = 65536;
