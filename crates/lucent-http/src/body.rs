use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::head::BodyMode;
use crate::stream::{find_subsequence, PeekableStream, IO_CHUNK_SIZE};

const CHUNK_LINE_LIMIT: usize = 8 * 1024;
const TRAILER_LIMIT: usize = 64 * 1024;

/// Decoded message body read off a `PeekableStream` according to its framing
/// mode. Yields payload bytes only: chunk sizes, terminators, and trailers
/// are consumed and discarded, leaving the stream positioned at the next
/// message head.
pub struct BodyReader<'a, S> {
    stream: &'a mut PeekableStream<S>,
    state: BodyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Exact { remaining: u64 },
    ChunkSizeLine,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    ChunkTrailers,
    UntilEof,
    Done,
}

impl<'a, S> BodyReader<'a, S> {
    pub fn new(stream: &'a mut PeekableStream<S>, mode: BodyMode) -> Self {
        let state = match mode {
            BodyMode::None => BodyState::Done,
            BodyMode::ContentLength(length) => BodyState::Exact { remaining: length },
            BodyMode::Chunked => BodyState::ChunkSizeLine,
            BodyMode::CloseDelimited => BodyState::UntilEof,
        };
        Self { stream, state }
    }

    pub fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BodyReader<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.state {
                BodyState::Done => return Poll::Ready(Ok(())),
                BodyState::Exact { remaining } => {
                    if remaining == 0 {
                        this.state = BodyState::Done;
                        continue;
                    }
                    match ready_payload(this.stream, cx, remaining, out)? {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            return Poll::Ready(Err(unexpected_eof(
                                "connection closed before body completed",
                            )))
                        }
                        Poll::Ready(Some(taken)) => {
                            let remaining = remaining - taken;
                            this.state = if remaining == 0 {
                                BodyState::Done
                            } else {
                                BodyState::Exact { remaining }
                            };
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
                BodyState::ChunkSizeLine => {
                    let line = match ready_line(this.stream, cx, CHUNK_LINE_LIMIT)? {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            return Poll::Ready(Err(unexpected_eof(
                                "connection closed before chunk size line was read",
                            )))
                        }
                        Poll::Ready(Some(line)) => line,
                    };
                    let size = parse_chunk_len(&line)?;
                    this.state = if size == 0 {
                        BodyState::ChunkTrailers
                    } else {
                        BodyState::ChunkData { remaining: size }
                    };
                }
                BodyState::ChunkData { remaining } => {
                    match ready_payload(this.stream, cx, remaining, out)? {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            return Poll::Ready(Err(unexpected_eof(
                                "connection closed inside a chunk",
                            )))
                        }
                        Poll::Ready(Some(taken)) => {
                            let remaining = remaining - taken;
                            this.state = if remaining == 0 {
                                BodyState::ChunkDataEnd
                            } else {
                                BodyState::ChunkData { remaining }
                            };
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
                BodyState::ChunkDataEnd => {
                    if this.stream.parts().1.len() < 2 {
                        match poll_fill(this.stream, cx)? {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(0) => {
                                return Poll::Ready(Err(unexpected_eof(
                                    "connection closed before chunk terminator",
                                )))
                            }
                            Poll::Ready(_) => continue,
                        }
                    }
                    let (_, buffer) = this.stream.parts();
                    if &buffer[..2] != b"\r\n" {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk terminator",
                        )));
                    }
                    buffer.drain(..2);
                    this.state = BodyState::ChunkSizeLine;
                }
                BodyState::ChunkTrailers => {
                    let line = match ready_line(this.stream, cx, TRAILER_LIMIT)? {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            return Poll::Ready(Err(unexpected_eof(
                                "connection closed before chunked trailers completed",
                            )))
                        }
                        Poll::Ready(Some(line)) => line,
                    };
                    if line.is_empty() {
                        this.state = BodyState::Done;
                    }
                }
                BodyState::UntilEof => {
                    let (_, buffer) = this.stream.parts();
                    if buffer.is_empty() {
                        match poll_fill(this.stream, cx)? {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(0) => {
                                this.state = BodyState::Done;
                                continue;
                            }
                            Poll::Ready(_) => {}
                        }
                    }
                    let (_, buffer) = this.stream.parts();
                    let take = buffer.len().min(out.remaining());
                    out.put_slice(&buffer[..take]);
                    buffer.drain(..take);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Copies up to `remaining` buffered payload bytes into `out`. `None` means
/// the stream closed before any byte was available.
fn ready_payload<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
    cx: &mut Context<'_>,
    remaining: u64,
    out: &mut ReadBuf<'_>,
) -> io::Result<Poll<Option<u64>>> {
    loop {
        let (_, buffer) = stream.parts();
        if buffer.is_empty() {
            match poll_fill(stream, cx)? {
                Poll::Pending => return Ok(Poll::Pending),
                Poll::Ready(0) => return Ok(Poll::Ready(None)),
                Poll::Ready(_) => continue,
            }
        }
        let (_, buffer) = stream.parts();
        let take = (remaining as usize).min(buffer.len()).min(out.remaining());
        out.put_slice(&buffer[..take]);
        buffer.drain(..take);
        return Ok(Poll::Ready(Some(take as u64)));
    }
}

/// Frames one CRLF-terminated line out of the stream buffer, without the
/// terminator. `None` means the stream closed before the line completed.
fn ready_line<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
    cx: &mut Context<'_>,
    limit: usize,
) -> io::Result<Poll<Option<Vec<u8>>>> {
    loop {
        let (_, buffer) = stream.parts();
        if let Some(position) = find_subsequence(buffer, b"\r\n") {
            let line = buffer[..position].to_vec();
            buffer.drain(..position + 2);
            return Ok(Poll::Ready(Some(line)));
        }
        if buffer.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk framing line exceeded limit",
            ));
        }
        match poll_fill(stream, cx)? {
            Poll::Pending => return Ok(Poll::Pending),
            Poll::Ready(0) => return Ok(Poll::Ready(None)),
            Poll::Ready(_) => {}
        }
    }
}

fn poll_fill<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
    cx: &mut Context<'_>,
) -> io::Result<Poll<usize>> {
    let (inner, buffer) = stream.parts();
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    let mut read_buf = ReadBuf::new(&mut chunk);
    match Pin::new(inner).poll_read(cx, &mut read_buf) {
        Poll::Ready(Ok(())) => {
            let filled = read_buf.filled();
            buffer.extend_from_slice(filled);
            Ok(Poll::Ready(filled.len()))
        }
        Poll::Ready(Err(error)) => Err(error),
        Poll::Pending => Ok(Poll::Pending),
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

fn unexpected_eof(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, message)
}

/// Outcome of bounded body buffering: a source shorter than the limit comes
/// back as bytes; a source that reaches the limit comes back as a reader
/// replaying the buffered prefix before the rest.
pub enum BodyBuffer<R> {
    Buffered(Vec<u8>),
    Streamed(ReplayReader<R>),
}

/// Replays a buffered prefix, then continues from the original reader.
pub struct ReplayReader<R> {
    prefix: Vec<u8>,
    position: usize,
    rest: R,
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplayReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position < this.prefix.len() {
            let take = (this.prefix.len() - this.position).min(out.remaining());
            out.put_slice(&this.prefix[this.position..this.position + take]);
            this.position += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.rest).poll_read(cx, out)
    }
}

/// Reads `reader` up to `limit` bytes. Fewer than `limit` bytes means the
/// whole body fit and is returned buffered; exactly `limit` bytes means more
/// may remain, so the caller gets a reader equivalent to the unread source.
pub async fn read_to_buffer_or_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> io::Result<BodyBuffer<R>> {
    let mut buffer = Vec::new();
    let mut limited = (&mut reader).take(limit as u64);
    limited.read_to_end(&mut buffer).await?;

    if buffer.len() == limit {
        Ok(BodyBuffer::Streamed(ReplayReader {
            prefix: buffer,
            position: 0,
            rest: reader,
        }))
    } else {
        Ok(BodyBuffer::Buffered(buffer))
    }
}

/// Copies `reader` to `writer` using chunked transfer encoding, terminating
/// with the zero chunk. Returns the payload byte count.
pub async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0_u64;
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            writer.write_all(b"0\r\n\r\n").await?;
            return Ok(total);
        }
        writer.write_all(format!("{read:x}\r\n").as_bytes()).await?;
        writer.write_all(&chunk[..read]).await?;
        writer.write_all(b"\r\n").await?;
        total += read as u64;
    }
}
