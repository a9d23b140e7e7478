use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Buffered reader over a bidirectional stream. Reads drain the buffer before
/// touching the underlying stream, which is what makes the non-consuming
/// `peek` and head framing possible on the same connection.
pub struct PeekableStream<S> {
    stream: S,
    read_buf: Vec<u8>,
}

impl<S> PeekableStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn parts(&mut self) -> (&mut S, &mut Vec<u8>) {
        (&mut self.stream, &mut self.read_buf)
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Returns the next `n` bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.read_buf.len() < n {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before peek completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.read_buf[..n])
    }

    /// Reads until `pattern` is seen and returns everything up to and
    /// including it. Returns `None` on a clean close before any byte arrived.
    pub async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                let bytes = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(bytes));
            }

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "HTTP header exceeded configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_buf.is_empty() {
            let take = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf[..take]);
            this.read_buf.drain(..take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
