//! A replayable buffering wrapper for Tokio `AsyncRead`.
//!
//! [`Replay`] accumulates input on demand so header sections can be
//! parsed in place, partially consumed, or handed back out as a prefix
//! when a connection changes mode (CONNECT handoff, MITM re-entry).

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A replayable buffering wrapper around an `AsyncRead`.
///
/// Data pulled in with [`buffer_more`](Self::buffer_more) stays
/// inspectable until it is explicitly [`discard`](Self::discard)ed;
/// regular reads drain the buffer first and then fall through to the
/// inner reader.
pub(crate) struct Replay<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Replay<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// True once the buffer limit is reached without consumption.
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() == self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Buffers more data from the inner reader.
    ///
    /// Returns the number of bytes added; zero means the inner reader
    /// hit end of stream or the buffer limit was reached.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }

    /// Returns a reference to the inner reader.
    pub(crate) fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Returns the unconsumed buffer and the inner reader.
    pub(crate) fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Replay<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

/// Writes pass straight through to the inner stream, so a `Replay`
/// around a full-duplex connection stays usable for both directions.
impl<R: AsyncWrite + Unpin> AsyncWrite for Replay<R> {
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

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn buffer_more_reads_all() {
        let mut r = Replay::new(cursor(b"abcdefgh"), usize::MAX);
        let n = r.buffer_more().await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(r.buffer(), b"abcdefgh");
    }

    #[tokio::test]
    async fn buffer_more_eof() {
        let mut r = Replay::new(cursor(b""), usize::MAX);
        let n = r.buffer_more().await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(r.buffer(), b"");
    }

    #[tokio::test]
    async fn buffer_more_respects_max() {
        let mut r = Replay::new(cursor(b"hello world"), 5);
        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"hello");
        assert!(r.is_full());
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn discard_then_read_from_buffer_then_inner() {
        let mut r = Replay::new(cursor(b"abcdef"), 4);
        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"abcd");
        r.discard(2);
        assert_eq!(r.buffer(), b"cd");

        let mut buf = [0u8; 2];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"cd");

        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn buffer_more_does_not_reset_pos() {
        let mut r = Replay::new(cursor(b"abcdefghij"), 4);
        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"abcd");
        r.discard(3);
        assert_eq!(r.buffer(), b"d");

        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"defg");
        r.discard(1);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"efghij");
    }

    #[tokio::test]
    async fn into_parts_returns_leftover() {
        let mut r = Replay::new(cursor(b"xyzw"), 3);
        r.buffer_more().await.unwrap();
        r.discard(1);
        let (left, mut inner) = r.into_parts();
        assert_eq!(&left[..], b"yz");
        let mut rest = Vec::new();
        inner.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"w");
    }
}
