use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::Uri;
use lucent_http::{
    host_with_default_port, is_normal_close_error, read_to_buffer_or_stream, BodyBuffer,
    BodyMode, BodyReader, Headers, HttpVersion, PeekableStream, ReplayReader, RequestHead,
    ResponseHead,
};
use lucent_tls::mirrored_client_config;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::TlsConnector;

use crate::addon::{
    dispatch_server_connected, dispatch_server_disconnected, dispatch_tls_established_server,
    guard_hook,
};
use crate::client::{
    header_map_to_headers, headers_to_header_map, send_h2_data, send_h2_request, Exchange, H1Conn,
    H2BodyReader, H2Handle, MainConnection, ServerSession, TargetForm, UpstreamRequest,
};
use crate::client::open_main_transport;
use crate::connection::{ConnContext, ServerConn};
use crate::entry::ProxyCore;
use crate::flow::{BodyStream, Flow, Request, Response};
use crate::BoxIo;

/// How the upstream is reached when the first request arrives on a
/// connection whose server side has not been dialed yet.
#[derive(Clone)]
pub(crate) enum DialPlan {
    /// Forward-proxy plain HTTP: dial the request's own URL.
    PlainHttp { head: RequestHead },
    /// Lazy interception: dial the CONNECT target and mirror the captured
    /// ClientHello onto the upstream handshake.
    TlsMirror {
        connect_head: RequestHead,
        authority: String,
    },
}

pub(crate) struct PipelineOutcome {
    pub(crate) close_client: bool,
}

struct ExchangeFailure {
    status: u16,
}

/// Holds the not-yet-boxed request body reader while any fallible,
/// client-stream-reborrowing step (addon short-circuit replies) is still in
/// play, so the eventual `Box<dyn AsyncRead>` borrow doesn't get unified
/// with those earlier reborrows by the compiler.
enum PendingRequestStream<'a, S> {
    Direct(BodyReader<'a, S>),
    Replay(ReplayReader<BodyReader<'a, S>>),
}

/// Holds the not-yet-boxed response body reader for the same reason as
/// [`PendingRequestStream`], but covering the three possible upstream
/// sources (main connection, session connection, HTTP/2 stream).
enum PendingResponseSource<'a> {
    H1(BodyReader<'a, BoxIo>),
    H2(&'a mut H2BodyReader),
    Empty(tokio::io::Empty),
}

impl AsyncRead for PendingResponseSource<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PendingResponseSource::H1(reader) => Pin::new(reader).poll_read(cx, buf),
            PendingResponseSource::H2(reader) => Pin::new(&mut **reader).poll_read(cx, buf),
            PendingResponseSource::Empty(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

enum PendingResponseOutcome<'a> {
    Buffered,
    Stream(PendingResponseSource<'a>),
    Replay(ReplayReader<PendingResponseSource<'a>>),
}

enum ExchangeOutput {
    SessionH1 {
        mode: BodyMode,
    },
    MainH1 {
        conn: H1Conn,
        mode: BodyMode,
    },
    H2 {
        reader: H2BodyReader,
        // Keeps a per-request HTTP/2 connection driver alive until the body
        // is fully relayed.
        _handle: Option<H2Handle>,
    },
}

/// Runs one intercepted or forward-proxied HTTP/1.1 request through the
/// addon pipeline and writes the reply.
pub(crate) async fn run_h1<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    dial_plan: Option<DialPlan>,
    client_stream: &mut PeekableStream<S>,
    head: RequestHead,
    scheme: &str,
    fallback_authority: Option<&str>,
) -> PipelineOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let url = match request_url(&head, scheme, fallback_authority) {
        Ok(url) => url,
        Err(error) => {
            tracing::debug!(%error, "request URL could not be formed");
            let _ = write_simple_response(client_stream, 400, "", &[]).await;
            return PipelineOutcome { close_client: true };
        }
    };

    let request = Request::from_head(&head, url);
    let mut flow = Flow::new(Arc::clone(ctx), request);
    ctx.increment_flow_count();

    let request_close = head.connection_close();
    let result = h1_phases(core, ctx, session, dial_plan, client_stream, head, &mut flow).await;
    flow.finish();

    match result {
        Ok(()) => PipelineOutcome {
            close_client: request_close || ctx.close_after_response(),
        },
        Err(error) => {
            log_transport_error(&error);
            PipelineOutcome { close_client: true }
        }
    }
}

async fn h1_phases<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    dial_plan: Option<DialPlan>,
    client_stream: &mut PeekableStream<S>,
    original_head: RequestHead,
    flow: &mut Flow,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let raw_authority = url_authority(&flow.request.url);
    let raw_scheme = url_scheme(&flow.request.url);

    // Request headers: any addon may short-circuit with its own response.
    for addon in core.registry.get() {
        guard_hook("request_headers", || addon.request_headers(flow));
        if flow.response.is_some() {
            reply_h1(client_stream, ctx, flow, None).await?;
            // The request body is still unread; discard it so the next
            // request on this connection frames correctly.
            if !drain_request_body(client_stream, original_head.body_mode()?).await? {
                ctx.set_close_after_response(true);
            }
            return Ok(());
        }
    }

    // Buffer the request body up to the streaming threshold; a flow already
    // flipped to streaming bypasses buffering entirely.
    let body_mode = original_head.body_mode()?;
    let threshold = core.config.stream_large_bodies;
    let pending_stream: Option<PendingRequestStream<'_, S>> = if flow.stream {
        Some(PendingRequestStream::Direct(BodyReader::new(
            &mut *client_stream,
            body_mode,
        )))
    } else {
        let body_reader = BodyReader::new(&mut *client_stream, body_mode);
        let buffered = match read_to_buffer_or_stream(body_reader, threshold).await {
            Ok(buffered) => buffered,
            Err(error) => {
                tracing::error!(%error, "failed to buffer request body");
                return write_simple_response(client_stream, 502, "", &[]).await;
            }
        };
        match buffered {
            BodyBuffer::Buffered(bytes) => {
                flow.request.body = Some(bytes);
                let mut replied = false;
                for addon in core.registry.get() {
                    guard_hook("request", || addon.request(flow));
                    if flow.response.is_some() {
                        replied = true;
                        break;
                    }
                }
                if replied {
                    reply_h1(client_stream, ctx, flow, None).await?;
                    return Ok(());
                }
                None
            }
            BodyBuffer::Streamed(chained) => {
                tracing::warn!(threshold, "request body too large, switching to stream");
                flow.stream = true;
                Some(PendingRequestStream::Replay(chained))
            }
        }
    };

    let mut upstream_source: Option<BodyStream<'_>> = pending_stream.map(|pending| match pending {
        PendingRequestStream::Direct(reader) => Box::new(reader) as BodyStream<'_>,
        PendingRequestStream::Replay(reader) => Box::new(reader) as BodyStream<'_>,
    });

    if flow.stream {
        if let Some(mut source) = upstream_source.take() {
            for addon in core.registry.get() {
                source = addon.stream_request_modifier(flow, source);
            }
            upstream_source = Some(source);
        }
    }

    // Execute against the upstream.
    let exchange = match execute_exchange(
        core,
        ctx,
        session,
        dial_plan,
        flow,
        &original_head,
        &raw_authority,
        &raw_scheme,
        upstream_source,
    )
    .await
    {
        Ok(output) => output,
        Err(failure) => {
            reply_error_h1(client_stream, failure.status).await?;
            ctx.set_close_after_response(true);
            return Ok(());
        }
    };

    // Response headers: addons may replace the body outright.
    for addon in core.registry.get() {
        guard_hook("response_headers", || addon.response_headers(flow));
    }
    if flow
        .response
        .as_ref()
        .is_some_and(|response| response.body.is_some())
    {
        // The upstream body stays unread; give up on reusing that
        // connection.
        close_server_session(core, ctx, session);
        reply_h1(client_stream, ctx, flow, None).await?;
        return Ok(());
    }

    // Buffer or stream the response body with the same threshold.
    let mut main_h1 = None;
    let mut h2_reader = None;
    let response_mode;
    match exchange {
        ExchangeOutput::SessionH1 { mode } => {
            response_mode = Some(mode);
        }
        ExchangeOutput::MainH1 { conn, mode } => {
            main_h1 = Some(conn);
            response_mode = Some(mode);
        }
        ExchangeOutput::H2 { reader, _handle } => {
            h2_reader = Some((reader, _handle));
            response_mode = None;
        }
    }

    let source: PendingResponseSource<'_> = if let Some(mode) = response_mode {
        if let Some(conn) = main_h1.as_mut() {
            PendingResponseSource::H1(conn.body_reader(mode))
        } else if let Some(session) = session.as_mut() {
            match &mut session.exchange {
                Exchange::H1(conn) => PendingResponseSource::H1(conn.body_reader(mode)),
                Exchange::H2(_) => PendingResponseSource::Empty(tokio::io::empty()),
            }
        } else {
            PendingResponseSource::Empty(tokio::io::empty())
        }
    } else if let Some((reader, _)) = h2_reader.as_mut() {
        PendingResponseSource::H2(reader)
    } else {
        PendingResponseSource::Empty(tokio::io::empty())
    };

    let response_outcome: PendingResponseOutcome<'_> = if flow.stream {
        PendingResponseOutcome::Stream(source)
    } else {
        match read_to_buffer_or_stream(source, threshold).await {
            Ok(BodyBuffer::Buffered(bytes)) => {
                if let Some(response) = flow.response.as_mut() {
                    response.body = Some(bytes);
                }
                for addon in core.registry.get() {
                    guard_hook("response", || addon.response(flow));
                }
                PendingResponseOutcome::Buffered
            }
            Ok(BodyBuffer::Streamed(chained)) => {
                tracing::warn!(threshold, "response body too large, switching to stream");
                flow.stream = true;
                PendingResponseOutcome::Replay(chained)
            }
            Err(error) => {
                tracing::error!(%error, "failed to buffer response body");
                close_server_session(core, ctx, session);
                return reply_error_h1(client_stream, 502).await;
            }
        }
    };

    let mut reply_stream: Option<BodyStream<'_>> = match response_outcome {
        PendingResponseOutcome::Buffered => None,
        PendingResponseOutcome::Stream(source) => Some(Box::new(source)),
        PendingResponseOutcome::Replay(chained) => Some(Box::new(chained)),
    };

    if flow.stream {
        if let Some(mut stream) = reply_stream.take() {
            for addon in core.registry.get() {
                stream = addon.stream_response_modifier(flow, stream);
            }
            reply_stream = Some(stream);
        }
    }

    reply_h1(client_stream, ctx, flow, reply_stream).await?;

    // A non-keepalive upstream response releases the server side eagerly.
    if ctx.close_after_response() {
        drop(main_h1);
        drop(h2_reader);
        close_server_session(core, ctx, session);
    }
    Ok(())
}

/// Runs one HTTP/2 stream of an intercepted connection through the pipeline.
pub(crate) async fn run_h2_stream(
    core: Arc<ProxyCore>,
    ctx: Arc<ConnContext>,
    mut sender: h2::client::SendRequest<Bytes>,
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let (parts, recv_body) = request.into_parts();
    let url = match h2_request_url(&parts) {
        Ok(url) => url,
        Err(error) => {
            tracing::debug!(%error, "HTTP/2 request URL could not be formed");
            respond.send_reset(h2::Reason::PROTOCOL_ERROR);
            return;
        }
    };

    let headers = header_map_to_headers(&parts.headers);
    let original_head = RequestHead {
        method: parts.method.to_string(),
        target: parts
            .uri
            .path_and_query()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        version: HttpVersion::Http11,
        headers: headers.clone(),
    };
    let request = Request::new(
        parts.method.to_string(),
        url,
        "HTTP/2.0".to_string(),
        headers,
    );
    let mut flow = Flow::new(Arc::clone(&ctx), request);
    ctx.increment_flow_count();

    let result = h2_phases(
        &core,
        &ctx,
        &mut sender,
        &mut respond,
        recv_body,
        original_head,
        &mut flow,
    )
    .await;
    flow.finish();

    if let Err(error) = result {
        log_transport_error(&error);
        respond.send_reset(h2::Reason::INTERNAL_ERROR);
    }
}

async fn h2_phases(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    sender: &mut h2::client::SendRequest<Bytes>,
    respond: &mut h2::server::SendResponse<Bytes>,
    recv_body: h2::RecvStream,
    original_head: RequestHead,
    flow: &mut Flow,
) -> io::Result<()> {
    let raw_authority = url_authority(&flow.request.url);
    let raw_scheme = url_scheme(&flow.request.url);

    for addon in core.registry.get() {
        guard_hook("request_headers", || addon.request_headers(flow));
        if flow.response.is_some() {
            return reply_h2(respond, ctx, flow, None).await;
        }
    }

    let threshold = core.config.stream_large_bodies;
    let mut upstream_source: Option<BodyStream<'_>> = None;
    if flow.stream {
        upstream_source = Some(Box::new(H2BodyReader::new(recv_body)));
    } else {
        let body_reader = H2BodyReader::new(recv_body);
        let buffered = match read_to_buffer_or_stream(body_reader, threshold).await {
            Ok(buffered) => buffered,
            Err(error) => {
                tracing::error!(%error, "failed to buffer request body");
                return reply_error_h2(respond, ctx, flow, 502).await;
            }
        };
        match buffered {
            BodyBuffer::Buffered(bytes) => {
                flow.request.body = Some(bytes);
                for addon in core.registry.get() {
                    guard_hook("request", || addon.request(flow));
                    if flow.response.is_some() {
                        return reply_h2(respond, ctx, flow, None).await;
                    }
                }
            }
            BodyBuffer::Streamed(chained) => {
                tracing::warn!(threshold, "request body too large, switching to stream");
                flow.stream = true;
                upstream_source = Some(Box::new(chained));
            }
        }
    }

    if flow.stream {
        if let Some(mut source) = upstream_source.take() {
            for addon in core.registry.get() {
                source = addon.stream_request_modifier(flow, source);
            }
            upstream_source = Some(source);
        }
    }

    let use_separate = flow.use_separate_client
        || url_authority(&flow.request.url) != raw_authority
        || url_scheme(&flow.request.url) != raw_scheme;

    let body: Option<BodyStream<'_>> = if flow.stream {
        upstream_source
    } else {
        let bytes = flow.request.body.clone().unwrap_or_default();
        if bytes.is_empty() {
            None
        } else {
            Some(Box::new(Cursor::new(bytes)))
        }
    };

    let exchange = if use_separate {
        match open_main_transport(
            &core.upstream_manager,
            &original_head,
            &flow.request.url,
            core.config.insecure_skip_verify,
        )
        .await
        {
            Ok(transport) => match transport.connection {
                MainConnection::H1(mut conn) => {
                    let framing = framing_for(flow, body.is_some());
                    let head = build_upstream_head(
                        &flow.request,
                        transport.target_form,
                        framing,
                        transport.proxy_userinfo.as_deref(),
                    );
                    let chunked = matches!(framing, Framing::Chunked);
                    if let Err(error) = conn
                        .send_request(UpstreamRequest {
                            head,
                            body,
                            chunked,
                        })
                        .await
                    {
                        log_transport_error(&error);
                        return reply_error_h2(respond, ctx, flow, 502).await;
                    }
                    match conn.read_response_head().await {
                        Ok(head) => {
                            let mode = head.body_mode(&flow.request.method)?;
                            populate_response(flow, ctx, &head)?;
                            ExchangeOutput::MainH1 { conn, mode }
                        }
                        Err(error) => {
                            log_transport_error(&error);
                            return reply_error_h2(respond, ctx, flow, 502).await;
                        }
                    }
                }
                MainConnection::H2(handle) => {
                    let mut main_sender = handle.sender();
                    match send_over_h2(&mut main_sender, flow, body).await {
                        Ok(reader) => ExchangeOutput::H2 {
                            reader,
                            _handle: Some(handle),
                        },
                        Err(error) => {
                            log_transport_error(&error);
                            return reply_error_h2(respond, ctx, flow, 502).await;
                        }
                    }
                }
            },
            Err(error) => {
                log_transport_error(&error);
                return reply_error_h2(respond, ctx, flow, dial_failure_status(&error)).await;
            }
        }
    } else {
        match send_over_h2(sender, flow, body).await {
            Ok(reader) => ExchangeOutput::H2 {
                reader,
                _handle: None,
            },
            Err(error) => {
                log_transport_error(&error);
                return reply_error_h2(respond, ctx, flow, 502).await;
            }
        }
    };

    for addon in core.registry.get() {
        guard_hook("response_headers", || addon.response_headers(flow));
    }
    if flow
        .response
        .as_ref()
        .is_some_and(|response| response.body.is_some())
    {
        return reply_h2(respond, ctx, flow, None).await;
    }

    let mut main_h1 = None;
    let mut h2_reader = None;
    let response_mode;
    match exchange {
        ExchangeOutput::SessionH1 { mode } => response_mode = Some(mode),
        ExchangeOutput::MainH1 { conn, mode } => {
            main_h1 = Some(conn);
            response_mode = Some(mode);
        }
        ExchangeOutput::H2 { reader, _handle } => {
            h2_reader = Some((reader, _handle));
            response_mode = None;
        }
    }

    let source_reader: BodyStream<'_> = if let Some(mode) = response_mode {
        if let Some(conn) = main_h1.as_mut() {
            Box::new(conn.body_reader(mode))
        } else {
            Box::new(tokio::io::empty())
        }
    } else if let Some((reader, _)) = h2_reader.as_mut() {
        Box::new(reader)
    } else {
        Box::new(tokio::io::empty())
    };

    let mut reply_stream: Option<BodyStream<'_>> = None;
    if flow.stream {
        reply_stream = Some(source_reader);
    } else {
        match read_to_buffer_or_stream(source_reader, threshold).await {
            Ok(BodyBuffer::Buffered(bytes)) => {
                if let Some(response) = flow.response.as_mut() {
                    response.body = Some(bytes);
                }
                for addon in core.registry.get() {
                    guard_hook("response", || addon.response(flow));
                }
            }
            Ok(BodyBuffer::Streamed(chained)) => {
                tracing::warn!(threshold, "response body too large, switching to stream");
                flow.stream = true;
                reply_stream = Some(Box::new(chained));
            }
            Err(error) => {
                tracing::error!(%error, "failed to buffer response body");
                return reply_error_h2(respond, ctx, flow, 502).await;
            }
        }
    }

    if flow.stream {
        if let Some(mut stream) = reply_stream.take() {
            for addon in core.registry.get() {
                stream = addon.stream_response_modifier(flow, stream);
            }
            reply_stream = Some(stream);
        }
    }

    reply_h2(respond, ctx, flow, reply_stream).await
}

async fn send_over_h2(
    sender: &mut h2::client::SendRequest<Bytes>,
    flow: &mut Flow,
    body: Option<BodyStream<'_>>,
) -> io::Result<H2BodyReader> {
    let request = build_h2_request(&flow.request)?;
    let (parts, reader) = send_h2_request(sender, request, body).await?;
    let mut headers = header_map_to_headers(&parts.headers);
    headers.remove("Content-Length");
    let mut response = Response::new(parts.status.as_u16(), headers, None);
    response.close = false;
    flow.response = Some(response);
    Ok(reader)
}

#[allow(clippy::too_many_arguments)]
async fn execute_exchange(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    dial_plan: Option<DialPlan>,
    flow: &mut Flow,
    original_head: &RequestHead,
    raw_authority: &str,
    raw_scheme: &str,
    upstream_source: Option<BodyStream<'_>>,
) -> Result<ExchangeOutput, ExchangeFailure> {
    let use_separate = flow.use_separate_client
        || url_authority(&flow.request.url) != raw_authority
        || url_scheme(&flow.request.url) != raw_scheme;

    let body: Option<BodyStream<'_>> = if flow.stream {
        upstream_source
    } else {
        let bytes = flow.request.body.clone().unwrap_or_default();
        if bytes.is_empty() {
            None
        } else {
            Some(Box::new(Cursor::new(bytes)))
        }
    };
    let framing = framing_for(flow, body.is_some());

    if use_separate {
        let transport = open_main_transport(
            &core.upstream_manager,
            original_head,
            &flow.request.url,
            core.config.insecure_skip_verify,
        )
        .await
        .map_err(|error| {
            log_transport_error(&error);
            ExchangeFailure {
                status: dial_failure_status(&error),
            }
        })?;

        return match transport.connection {
            MainConnection::H1(mut conn) => {
                let head = build_upstream_head(
                    &flow.request,
                    transport.target_form,
                    framing,
                    transport.proxy_userinfo.as_deref(),
                );
                conn.send_request(UpstreamRequest {
                    head,
                    body,
                    chunked: matches!(framing, Framing::Chunked),
                })
                .await
                .map_err(|error| transport_failure(&error))?;
                let response_head = conn
                    .read_response_head()
                    .await
                    .map_err(|error| transport_failure(&error))?;
                let mode = response_head
                    .body_mode(&flow.request.method)
                    .map_err(|error| transport_failure(&error))?;
                populate_response(flow, ctx, &response_head)
                    .map_err(|error| transport_failure(&error))?;
                Ok(ExchangeOutput::MainH1 { conn, mode })
            }
            MainConnection::H2(handle) => {
                let mut main_sender = handle.sender();
                let reader = send_over_h2(&mut main_sender, flow, body)
                    .await
                    .map_err(|error| transport_failure(&error))?;
                Ok(ExchangeOutput::H2 {
                    reader,
                    _handle: Some(handle),
                })
            }
        };
    }

    if session.is_none() {
        let Some(plan) = dial_plan else {
            return Err(ExchangeFailure { status: 502 });
        };
        let established = establish_session(core, ctx, plan).await.map_err(|error| {
            log_transport_error(&error);
            ExchangeFailure {
                status: dial_failure_status(&error),
            }
        })?;
        *session = Some(established);
    }
    let Some(session_ref) = session.as_mut() else {
        return Err(ExchangeFailure { status: 502 });
    };

    match &mut session_ref.exchange {
        Exchange::H1(conn) => {
            let head =
                build_upstream_head(&flow.request, TargetForm::Origin, framing, None);
            conn.send_request(UpstreamRequest {
                head,
                body,
                chunked: matches!(framing, Framing::Chunked),
            })
            .await
            .map_err(|error| transport_failure(&error))?;
            let response_head = conn
                .read_response_head()
                .await
                .map_err(|error| transport_failure(&error))?;
            let mode = response_head
                .body_mode(&flow.request.method)
                .map_err(|error| transport_failure(&error))?;
            populate_response(flow, ctx, &response_head)
                .map_err(|error| transport_failure(&error))?;
            Ok(ExchangeOutput::SessionH1 { mode })
        }
        Exchange::H2(handle) => {
            let mut h2_sender = handle.sender();
            let reader = send_over_h2(&mut h2_sender, flow, body)
                .await
                .map_err(|error| transport_failure(&error))?;
            Ok(ExchangeOutput::H2 {
                reader,
                _handle: None,
            })
        }
    }
}

const MAX_DRAIN_BYTES: u64 = 256 * 1024;

/// Discards an unread request body so keep-alive framing survives a
/// short-circuit reply. Returns false when the body is too large to drain.
async fn drain_request_body<S>(
    client_stream: &mut PeekableStream<S>,
    mode: BodyMode,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if mode == BodyMode::None {
        return Ok(true);
    }
    let body_reader = BodyReader::new(&mut *client_stream, mode);
    let mut limited = body_reader.take(MAX_DRAIN_BYTES + 1);
    let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    Ok(drained <= MAX_DRAIN_BYTES)
}

fn transport_failure(error: &io::Error) -> ExchangeFailure {
    log_transport_error(error);
    ExchangeFailure { status: 502 }
}

fn dial_failure_status(error: &io::Error) -> u16 {
    if error.to_string().contains("Proxy Authentication Required") {
        407
    } else {
        502
    }
}

/// Dials the deferred upstream for a connection and wires the lifecycle
/// events: `server_connected`, then (for TLS) `tls_established_server`.
pub(crate) async fn establish_session(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    plan: DialPlan,
) -> io::Result<ServerSession> {
    match plan {
        DialPlan::PlainHttp { head } => {
            let url = head.absolute_uri().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "request target is not absolute")
            })?;
            let addr = lucent_http::canonical_addr(&url);
            let io = core.upstream_manager.dial(&head, &addr).await?;
            let conn = Arc::new(ServerConn::new(addr, None));
            ctx.set_server(Arc::clone(&conn));
            dispatch_server_connected(&core.registry, ctx);
            Ok(ServerSession {
                conn,
                exchange: Exchange::H1(H1Conn::new(io)),
            })
        }
        DialPlan::TlsMirror {
            connect_head,
            authority,
        } => {
            let addr = host_with_default_port(&authority, 443);
            let io = core.upstream_manager.dial(&connect_head, &addr).await?;
            let conn = Arc::new(ServerConn::new(addr.clone(), None));
            ctx.set_server(Arc::clone(&conn));
            dispatch_server_connected(&core.registry, ctx);

            let hello = ctx.client().client_hello().unwrap_or_default();
            let sni = hello
                .server_name
                .clone()
                .unwrap_or_else(|| strip_port(&authority).to_string());
            let server_name = ServerName::try_from(sni).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name")
            })?;
            let config = mirrored_client_config(&hello, core.config.insecure_skip_verify);
            let tls = TlsConnector::from(config).connect(server_name, io).await?;
            dispatch_tls_established_server(&core.registry, ctx);

            let negotiated = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            if let Some(protocol) = &negotiated {
                conn.set_negotiated_protocol(&String::from_utf8_lossy(protocol));
            }
            let exchange = if negotiated.as_deref() == Some(b"h2".as_slice()) {
                Exchange::H2(H2Handle::handshake(tls).await?)
            } else {
                Exchange::H1(H1Conn::new(Box::new(tls)))
            };
            Ok(ServerSession { conn, exchange })
        }
    }
}

/// Tears the upstream side down, firing `server_disconnected` exactly once
/// for the connection context's server. Covers both transports held in a
/// session and upstream sockets consumed by opaque relays.
pub(crate) fn close_server_session(
    core: &ProxyCore,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
) {
    drop(session.take());
    if let Some(server) = ctx.server() {
        if server.mark_closed() {
            dispatch_server_disconnected(&core.registry, ctx);
        }
    }
}

fn populate_response(
    flow: &mut Flow,
    ctx: &Arc<ConnContext>,
    head: &ResponseHead,
) -> io::Result<()> {
    let close = head.connection_close(&flow.request.method)?;
    if close {
        ctx.set_close_after_response(true);
    }
    let mut headers = Headers::new();
    for header in head.headers.iter() {
        headers.append(header.name.clone(), header.value.clone());
    }
    let mut response = Response::new(head.status, headers, None);
    response.close = close;
    flow.response = Some(response);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    NoBody,
    ContentLength(usize),
    Chunked,
}

fn framing_for(flow: &Flow, has_body: bool) -> Framing {
    if flow.stream {
        return Framing::Chunked;
    }
    if !has_body {
        return Framing::NoBody;
    }
    Framing::ContentLength(flow.request.body.as_ref().map_or(0, Vec::len))
}

/// Builds the wire head for the upstream request: headers copied in order
/// with duplicates preserved, framing headers replaced to match how the body
/// is actually sent.
fn build_upstream_head(
    request: &Request,
    target_form: TargetForm,
    framing: Framing,
    proxy_userinfo: Option<&str>,
) -> RequestHead {
    let target = match target_form {
        TargetForm::Origin => request
            .url
            .path_and_query()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        TargetForm::Absolute => request.url.to_string(),
    };

    let mut headers = Headers::new();
    for header in request.headers.iter() {
        let lowered = header.name.to_ascii_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        headers.append(header.name.clone(), header.value.clone());
    }
    if headers.get("Host").is_none() {
        if let Some(authority) = request.url.authority() {
            headers.append("Host", authority.as_str());
        }
    }
    match framing {
        Framing::NoBody => {}
        Framing::ContentLength(length) => headers.append("Content-Length", length.to_string()),
        Framing::Chunked => headers.append("Transfer-Encoding", "chunked"),
    }
    if let Some(userinfo) = proxy_userinfo {
        headers.set(
            "Proxy-Authorization",
            format!("Basic {}", BASE64.encode(userinfo)),
        );
    }

    RequestHead {
        method: request.method.clone(),
        target,
        version: HttpVersion::Http11,
        headers,
    }
}

fn build_h2_request(request: &Request) -> io::Result<http::Request<()>> {
    let mut built = http::Request::builder()
        .method(request.method.as_str())
        .uri(request.url.clone())
        .version(http::Version::HTTP_2)
        .body(())
        .map_err(|error| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("building upstream request failed: {error}"),
            )
        })?;
    *built.headers_mut() = headers_to_header_map(&request.headers)?;
    Ok(built)
}

/// Writes the buffered/streamed reply to an HTTP/1.1 client. Body sources
/// are written in a fixed order: the pipeline stream, then the response's
/// reader field, then its buffered bytes.
pub(crate) async fn reply_h1<S>(
    client: &mut PeekableStream<S>,
    ctx: &Arc<ConnContext>,
    flow: &mut Flow,
    body_stream: Option<BodyStream<'_>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(response) = flow.response.as_mut() else {
        return write_simple_response(client, 502, "", &[]).await;
    };
    let close = response.close || ctx.close_after_response();

    let mut headers = Headers::new();
    for header in response.headers.iter() {
        let lowered = header.name.to_ascii_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        headers.append(header.name.clone(), header.value.clone());
    }
    if close {
        headers.append("Connection", "close");
    }

    let extra_reader = response.body_reader.take();
    let bodyless_status = response.status_code == 204 || response.status_code == 304;
    let chunked =
        !bodyless_status && (body_stream.is_some() || extra_reader.is_some());
    if chunked {
        headers.append("Transfer-Encoding", "chunked");
    } else if !bodyless_status {
        let length = response.body.as_ref().map_or(0, Vec::len);
        headers.append("Content-Length", length.to_string());
    }

    let head = ResponseHead {
        version: HttpVersion::Http11,
        status: response.status_code,
        reason: canonical_reason(response.status_code),
        headers,
    };
    client.write_all(&head.encode()).await?;

    if bodyless_status {
        return client.flush().await;
    }

    if chunked {
        let stream_part: BodyStream<'_> =
            body_stream.unwrap_or_else(|| Box::new(tokio::io::empty()));
        let reader_part: BodyStream<'static> =
            extra_reader.unwrap_or_else(|| Box::new(tokio::io::empty()));
        let bytes_part = Cursor::new(response.body.clone().unwrap_or_default());
        let mut chain = stream_part.chain(reader_part).chain(bytes_part);
        lucent_http::copy_chunked(&mut chain, client).await?;
    } else if let Some(bytes) = &response.body {
        client.write_all(bytes).await?;
    }
    client.flush().await
}

async fn reply_error_h1<S>(client: &mut PeekableStream<S>, status: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if status == 407 {
        return write_simple_response(
            client,
            407,
            "",
            &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
        )
        .await;
    }
    write_simple_response(client, status, "", &[]).await
}

/// Minimal response writer used by the router and error paths.
pub(crate) async fn write_simple_response<S>(
    client: &mut PeekableStream<S>,
    status: u16,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain; charset=utf-8");
    for (name, value) in extra_headers {
        headers.append(*name, *value);
    }
    headers.append("Content-Length", body.len().to_string());
    let head = ResponseHead {
        version: HttpVersion::Http11,
        status,
        reason: canonical_reason(status),
        headers,
    };
    client.write_all(&head.encode()).await?;
    client.write_all(body.as_bytes()).await?;
    client.flush().await
}

async fn reply_h2(
    respond: &mut h2::server::SendResponse<Bytes>,
    ctx: &Arc<ConnContext>,
    flow: &mut Flow,
    body_stream: Option<BodyStream<'_>>,
) -> io::Result<()> {
    let _ = ctx;
    let Some(response) = flow.response.as_mut() else {
        return reply_h2_simple(respond, 502).await;
    };

    let status = http::StatusCode::from_u16(response.status_code)
        .unwrap_or(http::StatusCode::BAD_GATEWAY);
    let mut built = http::Response::builder()
        .status(status)
        .body(())
        .map_err(|error| io::Error::other(format!("building client response failed: {error}")))?;
    *built.headers_mut() = headers_to_header_map(&response.headers)?;
    built.headers_mut().remove(http::header::CONTENT_LENGTH);

    let extra_reader = response.body_reader.take();
    let bytes = response.body.clone().unwrap_or_default();
    let has_body = body_stream.is_some() || extra_reader.is_some() || !bytes.is_empty();

    let mut send_stream = respond
        .send_response(built, !has_body)
        .map_err(crate::client::h2_to_io)?;
    if !has_body {
        return Ok(());
    }

    let stream_part: BodyStream<'_> = body_stream.unwrap_or_else(|| Box::new(tokio::io::empty()));
    let reader_part: BodyStream<'static> =
        extra_reader.unwrap_or_else(|| Box::new(tokio::io::empty()));
    let mut chain = stream_part.chain(reader_part).chain(Cursor::new(bytes));

    let mut chunk = [0_u8; 16 * 1024];
    loop {
        let read = chain.read(&mut chunk).await?;
        if read == 0 {
            send_stream
                .send_data(Bytes::new(), true)
                .map_err(crate::client::h2_to_io)?;
            return Ok(());
        }
        send_h2_data(&mut send_stream, Bytes::copy_from_slice(&chunk[..read])).await?;
    }
}

async fn reply_error_h2(
    respond: &mut h2::server::SendResponse<Bytes>,
    ctx: &Arc<ConnContext>,
    flow: &mut Flow,
    status: u16,
) -> io::Result<()> {
    let _ = (ctx, flow);
    reply_h2_simple(respond, status).await
}

async fn reply_h2_simple(
    respond: &mut h2::server::SendResponse<Bytes>,
    status: u16,
) -> io::Result<()> {
    let status =
        http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::BAD_GATEWAY);
    let built = http::Response::builder()
        .status(status)
        .body(())
        .map_err(|error| io::Error::other(format!("building error response failed: {error}")))?;
    respond
        .send_response(built, true)
        .map_err(crate::client::h2_to_io)?;
    Ok(())
}

fn canonical_reason(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn log_transport_error(error: &io::Error) {
    let message = error.to_string();
    if is_normal_close_error(&message) {
        tracing::debug!(error = %message, "normal transport error");
    } else {
        tracing::error!(error = %message, "unexpected transport error");
    }
}

/// Absolute request URL: the target itself when absolute-form, otherwise
/// assembled from the scheme, Host header, and origin-form target.
pub(crate) fn request_url(
    head: &RequestHead,
    scheme: &str,
    fallback_authority: Option<&str>,
) -> io::Result<Uri> {
    if let Some(uri) = head.absolute_uri() {
        return Ok(uri);
    }
    let authority = head
        .headers
        .get("Host")
        .map(str::to_string)
        .or_else(|| fallback_authority.map(str::to_string))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request has no host"))?;
    let path = if head.target.starts_with('/') {
        head.target.clone()
    } else {
        "/".to_string()
    };
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|error| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request URL could not be formed: {error}"),
            )
        })
}

fn h2_request_url(parts: &http::request::Parts) -> io::Result<Uri> {
    let uri = &parts.uri;
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let authority = uri
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|host| host.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request has no authority"))?;
    Uri::builder()
        .scheme("https")
        .authority(authority)
        .path_and_query(
            uri.path_and_query()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        )
        .build()
        .map_err(|error| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request URL could not be formed: {error}"),
            )
        })
}

fn url_authority(url: &Uri) -> String {
    url.authority()
        .map(|authority| authority.as_str().to_string())
        .unwrap_or_default()
}

fn url_scheme(url: &Uri) -> String {
    url.scheme_str().unwrap_or_default().to_string()
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|digit| digit.is_ascii_digit()) => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use lucent_http::{parse_request_head, Headers};

    use super::{build_upstream_head, request_url, Framing};
    use crate::client::TargetForm;
    use crate::flow::Request;

    fn request() -> Request {
        let mut headers = Headers::new();
        headers.append("Host", "example.com");
        headers.append("Accept", "*/*");
        headers.append("X-Tag", "one");
        headers.append("x-tag", "two");
        headers.append("Content-Length", "999");
        Request::new(
            "POST".to_string(),
            "http://example.com/submit?x=1".parse().expect("uri"),
            "HTTP/1.1".to_string(),
            headers,
        )
    }

    #[test]
    fn origin_form_head_preserves_order_and_duplicates() {
        let head =
            build_upstream_head(&request(), TargetForm::Origin, Framing::ContentLength(4), None);
        assert_eq!(head.target, "/submit?x=1");
        let values = head.headers.get_all("X-Tag").collect::<Vec<_>>();
        assert_eq!(values, vec!["one", "two"]);
        assert_eq!(head.headers.get("Content-Length"), Some("4"));
    }

    #[test]
    fn absolute_form_head_carries_proxy_credentials() {
        let head = build_upstream_head(
            &request(),
            TargetForm::Absolute,
            Framing::NoBody,
            Some("user:secret"),
        );
        assert_eq!(head.target, "http://example.com/submit?x=1");
        let auth = head
            .headers
            .get("Proxy-Authorization")
            .expect("proxy credentials present");
        assert!(auth.starts_with("Basic "));
        assert!(head.headers.get("Content-Length").is_none());
    }

    #[test]
    fn chunked_framing_replaces_stale_length() {
        let head = build_upstream_head(&request(), TargetForm::Origin, Framing::Chunked, None);
        assert_eq!(head.headers.get("Transfer-Encoding"), Some("chunked"));
        assert!(head.headers.get("Content-Length").is_none());
    }

    #[tokio::test]
    async fn reply_writes_body_sources_in_fixed_order() {
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        use std::sync::Arc;

        use lucent_http::PeekableStream;
        use tokio::io::AsyncReadExt;

        use super::reply_h1;
        use crate::connection::{ClientConn, ConnContext};
        use crate::flow::{BodyStream, Flow, Response};

        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40002);
        let ctx = Arc::new(ConnContext::new(Arc::new(ClientConn::new(peer))));
        let mut flow = Flow::new(Arc::clone(&ctx), request());

        let mut response = Response::new(200, lucent_http::Headers::new(), Some(b"third".to_vec()));
        response.body_reader = Some(Box::new(std::io::Cursor::new(b"second".to_vec())));
        flow.response = Some(response);

        let (client_end, mut observer) = tokio::io::duplex(16 * 1024);
        let mut stream = PeekableStream::new(client_end);
        let body_stream: BodyStream<'_> = Box::new(std::io::Cursor::new(b"first".to_vec()));
        reply_h1(&mut stream, &ctx, &mut flow, Some(body_stream))
            .await
            .expect("write reply");
        drop(stream);

        let mut written = Vec::new();
        observer
            .read_to_end(&mut written)
            .await
            .expect("read written reply");
        let text = String::from_utf8_lossy(&written).to_string();
        assert!(text.contains("Transfer-Encoding: chunked"));
        let first = text.find("first").expect("stream part present");
        let second = text.find("second").expect("reader part present");
        let third = text.find("third").expect("buffered part present");
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn request_url_assembles_origin_form_targets() {
        let head = parse_request_head(b"GET /p?q=2 HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
            .expect("parse head");
        let url = request_url(&head, "https", None).expect("form url");
        assert_eq!(url.to_string(), "https://api.example.com/p?q=2");

        let bare = parse_request_head(b"GET /p HTTP/1.1\r\n\r\n").expect("parse head");
        let url = request_url(&bare, "https", Some("fallback.example:443")).expect("form url");
        assert_eq!(url.authority().map(|a| a.as_str()), Some("fallback.example:443"));
    }
}
