use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) use self::replay::Replay;
use crate::parse::BodyFraming;

mod replay;

/// Bidirectionally copy between two stream halves using caller-provided
/// buffers, shutting down each write side once its source is drained.
///
/// Returns the per-direction results `(a_to_b, b_to_a)` so the caller
/// can classify them independently.
pub(crate) async fn pipe(
    a_recv: &mut (impl AsyncRead + Send + Unpin),
    a_send: &mut (impl AsyncWrite + Send + Unpin),
    b_recv: &mut (impl AsyncRead + Send + Unpin),
    b_send: &mut (impl AsyncWrite + Send + Unpin),
    buf_a: &mut [u8],
    buf_b: &mut [u8],
) -> (io::Result<u64>, io::Result<u64>) {
    let (a_to_b, b_to_a) = tokio::join!(
        async {
            let res = copy_with_buffer(a_recv, b_send, buf_a).await;
            b_send.shutdown().await.ok();
            trace!(?res, "pipe a-to-b finished");
            res
        },
        async {
            let res = copy_with_buffer(b_recv, a_send, buf_b).await;
            a_send.shutdown().await.ok();
            trace!(?res, "pipe b-to-a finished");
            res
        }
    );
    (a_to_b, b_to_a)
}

/// Copies until end of stream through the provided buffer.
pub(crate) async fn copy_with_buffer(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    buf: &mut [u8],
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Copies exactly `n` bytes from `reader` to `writer`.
pub(crate) async fn copy_exact(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    n: u64,
) -> io::Result<u64> {
    let mut remaining = n;
    let mut buf = [0u8; 16 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let got = reader.read(&mut buf[..want]).await?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside sized body",
            ));
        }
        writer.write_all(&buf[..got]).await?;
        remaining -= got as u64;
    }
    Ok(n)
}

/// Copies one HTTP/1.1 chunked body.
///
/// With `dechunk` set, only the chunk payloads are written (for clients
/// below HTTP/1.1 that cannot parse chunked framing); otherwise the
/// framing is forwarded verbatim, trailers included.
pub(crate) async fn copy_chunked(
    reader: &mut Replay<impl AsyncRead + Unpin>,
    writer: &mut (impl AsyncWrite + Unpin),
    dechunk: bool,
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let line = read_line(reader).await?;
        let size = parse_chunk_size(&line)?;
        if !dechunk {
            writer.write_all(&line).await?;
        }
        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let trailer = read_line(reader).await?;
                if !dechunk {
                    writer.write_all(&trailer).await?;
                }
                if trailer == b"\r\n" || trailer == b"\n" {
                    break;
                }
            }
            writer.flush().await?;
            return Ok(total);
        }
        copy_exact(reader, writer, size).await?;
        total += size;
        let crlf = read_line(reader).await?;
        if !dechunk {
            writer.write_all(&crlf).await?;
        }
    }
}

/// Copies a body with the given framing. `dechunk` only applies to
/// chunked bodies.
pub(crate) async fn copy_body(
    framing: &BodyFraming,
    reader: &mut Replay<impl AsyncRead + Unpin>,
    writer: &mut (impl AsyncWrite + Unpin),
    dechunk: bool,
) -> io::Result<u64> {
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(n) => copy_exact(reader, writer, *n).await,
        BodyFraming::Chunked => copy_chunked(reader, writer, dechunk).await,
        BodyFraming::UntilClose => io::copy(reader, writer).await,
    }
}

/// Discards a body without forwarding it anywhere.
pub(crate) async fn drain_body(
    framing: &BodyFraming,
    reader: &mut Replay<impl AsyncRead + Unpin>,
) -> io::Result<u64> {
    copy_body(framing, reader, &mut io::sink(), false).await
}

/// Reads a single line (through `\n`) from the replay buffer.
async fn read_line(reader: &mut Replay<impl AsyncRead + Unpin>) -> io::Result<Vec<u8>> {
    loop {
        if let Some(pos) = reader.buffer().iter().position(|b| *b == b'\n') {
            let line = reader.buffer()[..=pos].to_vec();
            reader.discard(pos + 1);
            return Ok(line);
        }
        if reader.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk header line exceeds buffer limit",
            ));
        }
        if reader.buffer_more().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside chunked body",
            ));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk header"))?;
    let size_part = text
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size_part, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

/// Writer that forwards everything to `inner` while keeping a bounded
/// copy for the per-connection wire log.
pub(crate) struct TeeWriter<'a, W> {
    inner: &'a mut W,
    log: &'a mut Vec<u8>,
    cap: usize,
}

impl<'a, W: AsyncWrite + Unpin> TeeWriter<'a, W> {
    pub(crate) fn new(inner: &'a mut W, log: &'a mut Vec<u8>, cap: usize) -> Self {
        Self { inner, log, cap }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut *this.inner).poll_write(cx, buf))?;
        let room = this.cap.saturating_sub(this.log.len());
        this.log.extend_from_slice(&buf[..n.min(room)]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}
