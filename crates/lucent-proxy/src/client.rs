use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, Uri};
use lucent_http::{
    copy_chunked, parse_response_head, BodyMode, BodyReader, Headers, PeekableStream, RequestHead,
    ResponseHead, MAX_HEAD_BYTES,
};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::connection::ServerConn;
use crate::flow::BodyStream;
use crate::upstream::{proxy_host_port, proxy_userinfo, UpstreamManager};
use crate::BoxIo;

const H2_FORWARD_CHUNK_LIMIT: usize = 16 * 1024;

/// The upstream side of one client connection: shared metadata plus the
/// transport the pipeline executes requests on.
pub(crate) struct ServerSession {
    pub(crate) conn: Arc<ServerConn>,
    pub(crate) exchange: Exchange,
}

/// A reusable upstream transport. The reused-connection client variants are
/// `H1` over an existing TCP or TLS stream; `H2` multiplexes one
/// already-established HTTP/2 connection.
pub(crate) enum Exchange {
    H1(H1Conn),
    H2(H2Handle),
}

/// Request target form on the wire: origin-form to servers, absolute-form to
/// plain-HTTP proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetForm {
    Origin,
    Absolute,
}

pub(crate) struct UpstreamRequest<'a> {
    pub(crate) head: RequestHead,
    pub(crate) body: Option<BodyStream<'a>>,
    pub(crate) chunked: bool,
}

/// One HTTP/1.1 connection to an upstream, plain or TLS.
pub(crate) struct H1Conn {
    stream: PeekableStream<BoxIo>,
}

impl H1Conn {
    pub(crate) fn new(io: BoxIo) -> Self {
        Self {
            stream: PeekableStream::new(io),
        }
    }

    pub(crate) async fn send_request(&mut self, request: UpstreamRequest<'_>) -> io::Result<()> {
        self.stream.write_all(&request.head.encode()).await?;
        if let Some(mut body) = request.body {
            if request.chunked {
                copy_chunked(&mut body, &mut self.stream).await?;
            } else {
                tokio::io::copy(&mut body, &mut self.stream).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next final response head, skipping informational 1xx
    /// responses other than 101.
    pub(crate) async fn read_response_head(&mut self) -> io::Result<ResponseHead> {
        loop {
            let raw = self
                .stream
                .read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES)
                .await?
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upstream closed before response headers",
                    )
                })?;
            let head = parse_response_head(&raw)?;
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok(head);
        }
    }

    pub(crate) fn body_reader(&mut self, mode: BodyMode) -> BodyReader<'_, BoxIo> {
        BodyReader::new(&mut self.stream, mode)
    }
}

/// Handle to an established upstream HTTP/2 connection: the cloneable
/// request sender plus the spawned connection driver.
pub(crate) struct H2Handle {
    sender: h2::client::SendRequest<Bytes>,
    driver: JoinHandle<()>,
}

impl H2Handle {
    pub(crate) async fn handshake<S>(io: S) -> io::Result<Self>
    where
        S: AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = h2::client::handshake(io).await.map_err(h2_to_io)?;
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%error, "upstream HTTP/2 connection ended");
            }
        });
        Ok(Self { sender, driver })
    }

    pub(crate) fn sender(&self) -> h2::client::SendRequest<Bytes> {
        self.sender.clone()
    }
}

impl Drop for H2Handle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Sends one request over HTTP/2, forwarding the body with window
/// backpressure, and returns the response head plus its body stream.
pub(crate) async fn send_h2_request(
    sender: &mut h2::client::SendRequest<Bytes>,
    request: http::Request<()>,
    body: Option<BodyStream<'_>>,
) -> io::Result<(http::response::Parts, H2BodyReader)> {
    let mut ready = sender.clone().ready().await.map_err(h2_to_io)?;
    let end_stream = body.is_none();
    let (response, mut send_stream) = ready
        .send_request(request, end_stream)
        .map_err(h2_to_io)?;

    if let Some(mut body) = body {
        let mut chunk = [0_u8; H2_FORWARD_CHUNK_LIMIT];
        loop {
            let read = body.read(&mut chunk).await?;
            if read == 0 {
                send_stream
                    .send_data(Bytes::new(), true)
                    .map_err(h2_to_io)?;
                break;
            }
            send_h2_data(&mut send_stream, Bytes::copy_from_slice(&chunk[..read])).await?;
        }
    }

    let response = response.await.map_err(h2_to_io)?;
    let (parts, recv) = response.into_parts();
    Ok((parts, H2BodyReader::new(recv)))
}

pub(crate) async fn send_h2_data(
    sink: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
) -> io::Result<()> {
    while !data.is_empty() {
        let available = wait_for_h2_capacity(sink, data.len()).await?;
        let send_len = available.min(data.len()).min(H2_FORWARD_CHUNK_LIMIT);
        if send_len == 0 {
            continue;
        }
        let chunk = data.split_to(send_len);
        sink.send_data(chunk, false).map_err(h2_to_io)?;
    }
    Ok(())
}

async fn wait_for_h2_capacity(
    sink: &mut h2::SendStream<Bytes>,
    desired: usize,
) -> io::Result<usize> {
    sink.reserve_capacity(desired);
    loop {
        match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(Ok(capacity)) if capacity > 0 => return Ok(capacity),
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(h2_to_io(error)),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 send stream closed before capacity became available",
                ))
            }
        }
    }
}

/// Decoded HTTP/2 body as an `AsyncRead`, releasing flow-control window as
/// bytes are consumed. Trailers are discarded.
pub(crate) struct H2BodyReader {
    stream: h2::RecvStream,
    leftover: Bytes,
    done: bool,
}

impl H2BodyReader {
    pub(crate) fn new(stream: h2::RecvStream) -> Self {
        Self {
            stream,
            leftover: Bytes::new(),
            done: false,
        }
    }
}

impl AsyncRead for H2BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let take = this.leftover.len().min(out.remaining());
                out.put_slice(&this.leftover.split_to(take));
                let _ = this.stream.flow_control().release_capacity(take);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match this.stream.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Ready(Some(Ok(bytes))) => {
                    this.leftover = bytes;
                }
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Err(h2_to_io(error)));
                }
            }
        }
    }
}

pub(crate) fn h2_to_io(error: h2::Error) -> io::Error {
    io::Error::other(format!("HTTP/2 error: {error}"))
}

/// The separate client: a fresh connection per request, honoring the
/// upstream-proxy resolution chain, never following redirects, never
/// decompressing.
pub(crate) enum MainConnection {
    H1(H1Conn),
    H2(H2Handle),
}

pub(crate) struct MainTransport {
    pub(crate) connection: MainConnection,
    pub(crate) target_form: TargetForm,
    /// Userinfo for `Proxy-Authorization` when speaking absolute-form
    /// through a plain-HTTP proxy.
    pub(crate) proxy_userinfo: Option<String>,
}

pub(crate) async fn open_main_transport(
    manager: &UpstreamManager,
    original: &RequestHead,
    url: &Uri,
    insecure_skip_verify: bool,
) -> io::Result<MainTransport> {
    let scheme = url.scheme_str().unwrap_or("http");
    let target_addr = lucent_http::canonical_addr(url);
    let proxy_url = manager.resolve_proxy_url(original)?;

    if scheme == "https" {
        let io: BoxIo = match &proxy_url {
            None => Box::new(TcpStream::connect(&target_addr).await?),
            Some(proxy_url) => manager.dial_via_proxy(proxy_url, &target_addr).await?,
        };
        let host = url
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URL has no host"))?
            .to_string();
        let server_name = ServerName::try_from(host).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid server name in request URL")
        })?;
        let config = lucent_tls::upstream_client_config(
            insecure_skip_verify,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        );
        let tls = TlsConnector::from(config).connect(server_name, io).await?;
        let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        let connection = if negotiated_h2 {
            MainConnection::H2(H2Handle::handshake(tls).await?)
        } else {
            MainConnection::H1(H1Conn::new(Box::new(tls)))
        };
        return Ok(MainTransport {
            connection,
            target_form: TargetForm::Origin,
            proxy_userinfo: None,
        });
    }

    match proxy_url {
        Some(proxy_url) if proxy_url.scheme_str() == Some("socks5") => {
            let io = manager.dial_via_proxy(&proxy_url, &target_addr).await?;
            Ok(MainTransport {
                connection: MainConnection::H1(H1Conn::new(io)),
                target_form: TargetForm::Origin,
                proxy_userinfo: None,
            })
        }
        Some(proxy_url) => {
            // Plain HTTP through an HTTP proxy speaks absolute-form with no
            // CONNECT tunnel.
            let proxy_addr = proxy_host_port(&proxy_url)?;
            let stream = TcpStream::connect(&proxy_addr).await?;
            let io: BoxIo = if proxy_url.scheme_str() == Some("https") {
                let proxy_host = proxy_url
                    .host()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "proxy URL has no host")
                    })?
                    .to_string();
                let server_name = ServerName::try_from(proxy_host).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid proxy server name")
                })?;
                let config =
                    lucent_tls::upstream_client_config(insecure_skip_verify, Vec::new());
                Box::new(TlsConnector::from(config).connect(server_name, stream).await?)
            } else {
                Box::new(stream)
            };
            Ok(MainTransport {
                connection: MainConnection::H1(H1Conn::new(io)),
                target_form: TargetForm::Absolute,
                proxy_userinfo: proxy_userinfo(&proxy_url),
            })
        }
        None => {
            let stream = TcpStream::connect(&target_addr).await?;
            Ok(MainTransport {
                connection: MainConnection::H1(H1Conn::new(Box::new(stream))),
                target_form: TargetForm::Origin,
                proxy_userinfo: None,
            })
        }
    }
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Converts the ordered header list into an `http::HeaderMap` for HTTP/2,
/// dropping connection-level headers the protocol forbids.
pub(crate) fn headers_to_header_map(headers: &Headers) -> io::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for header in headers.iter() {
        let lowered = header.name.to_ascii_lowercase();
        if lowered == "host" || HOP_BY_HOP_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| invalid_header(&header.name))?;
        let value = http::header::HeaderValue::from_str(&header.value)
            .map_err(|_| invalid_header(&header.name))?;
        map.append(name, value);
    }
    Ok(map)
}

pub(crate) fn header_map_to_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map.iter() {
        headers.append(
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        );
    }
    headers
}

fn invalid_header(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("header {name} cannot be represented"),
    )
}
