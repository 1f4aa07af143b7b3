use std::io;

use n0_error::{AnyError, e, stack_error};

/// Failure surfaced by a proxy session.
///
/// Expected peer terminations (EOF, resets, timeouts) never become a
/// `ProxyError`; the request loop swallows them via [`is_unexpected`]
/// and exits cleanly.
#[stack_error(add_meta, derive)]
pub enum ProxyError {
    /// An I/O operation failed.
    Io { source: AnyError },
    /// A downstream request could not be parsed.
    ReadRequest { source: AnyError },
    /// Dialing the origin failed.
    Dial { source: AnyError },
    /// The exchange with the origin failed.
    RoundTrip { source: AnyError },
    /// TLS interception failed.
    Mitm { source: AnyError },
    /// Copying tunneled bytes failed.
    Tunnel { source: AnyError },
    /// Writing a response downstream failed.
    WriteResponse { source: AnyError },
    /// The session task panicked. The downstream connection is closed.
    Panic { message: String },
}

impl From<io::Error> for ProxyError {
    #[track_caller]
    fn from(value: io::Error) -> Self {
        e!(ProxyError::Io, value.into())
    }
}

/// Whether an I/O error indicates a real failure rather than a routine
/// peer termination.
///
/// HTTP persistent connections routinely close asymmetrically: either
/// side may drop the connection between requests, or mid-flight once it
/// loses interest. Those states read as errors at the socket layer but
/// are normal protocol behavior, so they must not surface through the
/// error handler.
pub fn is_unexpected(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    match err.kind() {
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | TimedOut
        | WouldBlock | NotConnected | WriteZero => false,
        _ => {
            let text = err.to_string();
            !(text.ends_with("EOF")
                || text.contains("i/o timeout")
                || text.contains("use of closed network connection")
                || text.contains("Use of idled network connection")
                || text.contains("broken pipe")
                || text.contains("connection reset by peer"))
        }
    }
}
