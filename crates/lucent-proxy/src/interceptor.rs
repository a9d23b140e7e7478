use std::io;
use std::sync::Arc;

use http::Uri;
use lucent_http::{
    host_with_default_port, is_tls_client_hello, parse_request_head, Headers, PeekableStream,
    RequestHead, MAX_HEAD_BYTES,
};
use lucent_tls::{mirrored_client_config, ClientHelloSummary};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use crate::addon::{
    dispatch_server_connected, dispatch_tls_established_server, guard_hook,
};
use crate::client::{h2_to_io, Exchange, H1Conn, H2Handle, ServerSession};
use crate::connection::{ConnContext, ServerConn};
use crate::entry::ProxyCore;
use crate::flow::{Flow, Request, Response};
use crate::pipeline::{
    self, log_transport_error, run_h2_stream, write_simple_response, DialPlan,
};
use crate::websocket;
use crate::BoxIo;

const H2_MAX_CONCURRENT_STREAMS: u32 = 100;

/// CONNECT handler: evaluates the intercept policy and runs one of the three
/// tunnel modes. Consumes the connection.
pub(crate) async fn handle_connect<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    client_stream: &mut PeekableStream<S>,
    head: RequestHead,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let should_intercept = core
        .should_intercept()
        .map_or(true, |rule| rule(&head));
    ctx.set_intercept(should_intercept);

    let url = match head.target.parse::<Uri>() {
        Ok(url) => url,
        Err(_) => {
            return write_simple_response(client_stream, 400, "", &[]).await;
        }
    };
    let mut flow = Flow::new(Arc::clone(ctx), Request::from_head(&head, url));

    for addon in core.registry.get() {
        guard_hook("request_headers", || addon.request_headers(&mut flow));
    }

    let result = if !should_intercept {
        tracing::debug!(host = %head.target, "begin opaque transfer");
        direct_transfer(core, ctx, client_stream, &head, &mut flow).await
    } else if ctx.client().upstream_cert() {
        dial_first_intercept(core, ctx, session, client_stream, &head, &mut flow).await
    } else {
        tracing::debug!(host = %head.target, "begin lazy intercept");
        lazy_intercept(core, ctx, session, client_stream, &head, &mut flow).await
    };
    flow.finish();
    result
}

/// Writes the bit-exact tunnel acknowledgement and records the synthetic 200
/// on the flow before `response_headers` fires.
async fn establish_tunnel<S>(
    core: &Arc<ProxyCore>,
    client_stream: &mut PeekableStream<S>,
    flow: &mut Flow,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    client_stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    flow.response = Some(Response::new(200, Headers::new(), None));
    for addon in core.registry.get() {
        guard_hook("response_headers", || addon.response_headers(flow));
    }
    Ok(())
}

/// Opaque tunnel: bytes relay both ways with no interception and no forged
/// certificate.
async fn direct_transfer<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    client_stream: &mut PeekableStream<S>,
    head: &RequestHead,
    flow: &mut Flow,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _ = ctx;
    let target = host_with_default_port(&head.target, 443);
    let mut upstream = match core.upstream_manager.dial(head, &target).await {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!(%error, host = %head.target, "opaque tunnel dial failed");
            return reply_connect_error(client_stream, &error).await;
        }
    };

    establish_tunnel(core, client_stream, flow).await?;
    if let Err(error) = tokio::io::copy_bidirectional(client_stream, &mut upstream).await {
        log_transport_error(&error);
    }
    Ok(())
}

/// Dial-first interception: the upstream socket exists before the client
/// handshake so the forged certificate can mirror the upstream's ALPN.
async fn dial_first_intercept<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    client_stream: &mut PeekableStream<S>,
    head: &RequestHead,
    flow: &mut Flow,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = host_with_default_port(&head.target, 443);
    let mut upstream_io = match core.upstream_manager.dial(head, &target).await {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!(%error, host = %head.target, "upstream dial failed");
            return reply_connect_error(client_stream, &error).await;
        }
    };
    let server_conn = Arc::new(ServerConn::new(target.clone(), None));
    ctx.set_server(Arc::clone(&server_conn));
    dispatch_server_connected(&core.registry, ctx);

    establish_tunnel(core, client_stream, flow).await?;

    let peeked = match client_stream.peek(3).await {
        Ok(bytes) => bytes.to_vec(),
        Err(error) => {
            tracing::debug!(%error, "peek after tunnel establishment failed");
            return Ok(());
        }
    };
    if !is_tls_client_hello(&peeked) {
        if let Err(error) =
            tokio::io::copy_bidirectional(client_stream, &mut upstream_io).await
        {
            log_transport_error(&error);
        }
        return Ok(());
    }

    ctx.client().set_tls(true);
    splice_and_serve(
        core,
        ctx,
        session,
        client_stream,
        upstream_io,
        head,
        server_conn,
    )
    .await
}

/// The TLS splice: pause the client handshake at ClientHello, mirror it onto
/// the upstream handshake, then finish the client side with a leaf whose
/// ALPN equals the upstream's negotiated protocol.
async fn splice_and_serve<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    client_stream: &mut PeekableStream<S>,
    upstream_io: BoxIo,
    head: &RequestHead,
    server_conn: Arc<ServerConn>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let acceptor =
        LazyConfigAcceptor::new(rustls::server::Acceptor::default(), &mut *client_stream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(error) => {
            tracing::error!(%error, "client handshake failed");
            return Ok(());
        }
    };
    let summary = ClientHelloSummary::from_client_hello(&start.client_hello());
    ctx.client().set_client_hello(summary.clone());
    let sni = summary
        .server_name
        .clone()
        .unwrap_or_else(|| strip_port(&head.target).to_string());

    let Ok(server_name) = ServerName::try_from(sni.clone()) else {
        tracing::error!(host = %sni, "invalid server name for upstream TLS");
        return Ok(());
    };
    let config = mirrored_client_config(&summary, core.config.insecure_skip_verify);
    let upstream_tls = match TlsConnector::from(config)
        .connect(server_name, upstream_io)
        .await
    {
        Ok(tls) => tls,
        Err(error) => {
            tracing::error!(%error, host = %sni, "upstream TLS handshake failed");
            return Ok(());
        }
    };
    dispatch_tls_established_server(&core.registry, ctx);

    let negotiated = upstream_tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(<[u8]>::to_vec);
    if let Some(protocol) = &negotiated {
        server_conn.set_negotiated_protocol(&String::from_utf8_lossy(protocol));
    }

    let leaf = match core.ca.get_cert(&sni) {
        Ok(leaf) => leaf,
        Err(error) => {
            tracing::error!(%error, host = %sni, "leaf issuance failed");
            return Ok(());
        }
    };
    let alpn = negotiated.clone().map(|protocol| vec![protocol]).unwrap_or_default();
    let server_config = match core.ca.server_config(&leaf, alpn) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, host = %sni, "leaf server config failed");
            return Ok(());
        }
    };
    let client_tls = match start.into_stream(server_config).await {
        Ok(tls) => tls,
        Err(error) => {
            tracing::error!(%error, "client handshake failed");
            return Ok(());
        }
    };
    let client_protocol = client_tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    ctx.client()
        .set_negotiated_protocol(&String::from_utf8_lossy(&client_protocol));

    if client_protocol == b"h2" && negotiated.as_deref() == Some(b"h2".as_slice()) {
        return serve_h2_connection(core, ctx, client_tls, upstream_tls).await;
    }

    let exchange = if negotiated.as_deref() == Some(b"h2".as_slice()) {
        Exchange::H2(H2Handle::handshake(upstream_tls).await?)
    } else {
        Exchange::H1(H1Conn::new(Box::new(upstream_tls)))
    };
    *session = Some(ServerSession {
        conn: server_conn,
        exchange,
    });
    serve_intercepted_h1(core, ctx, session, client_tls, None, head.target.clone()).await
}

/// Lazy interception: accept the client handshake immediately with a forged
/// certificate (ALPN fixed to http/1.1) and defer the upstream dial to the
/// first request.
async fn lazy_intercept<S>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    client_stream: &mut PeekableStream<S>,
    head: &RequestHead,
    flow: &mut Flow,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    establish_tunnel(core, client_stream, flow).await?;

    let peeked = match client_stream.peek(3).await {
        Ok(bytes) => bytes.to_vec(),
        Err(error) => {
            tracing::debug!(%error, "peek after tunnel establishment failed");
            return Ok(());
        }
    };
    if !is_tls_client_hello(&peeked) {
        let target = host_with_default_port(&head.target, 443);
        let mut upstream = match core.upstream_manager.dial(head, &target).await {
            Ok(upstream) => upstream,
            Err(error) => {
                tracing::error!(%error, host = %head.target, "upstream dial failed");
                return Ok(());
            }
        };
        let server_conn = Arc::new(ServerConn::new(target, None));
        ctx.set_server(Arc::clone(&server_conn));
        dispatch_server_connected(&core.registry, ctx);
        if let Err(error) =
            tokio::io::copy_bidirectional(client_stream, &mut upstream).await
        {
            log_transport_error(&error);
        }
        return Ok(());
    }

    ctx.client().set_tls(true);
    let acceptor =
        LazyConfigAcceptor::new(rustls::server::Acceptor::default(), &mut *client_stream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(error) => {
            tracing::error!(%error, "client handshake failed");
            return Ok(());
        }
    };
    let summary = ClientHelloSummary::from_client_hello(&start.client_hello());
    ctx.client().set_client_hello(summary.clone());
    let sni = summary
        .server_name
        .clone()
        .unwrap_or_else(|| strip_port(&head.target).to_string());

    let leaf = match core.ca.get_cert(&sni) {
        Ok(leaf) => leaf,
        Err(error) => {
            tracing::error!(%error, host = %sni, "leaf issuance failed");
            return Ok(());
        }
    };
    let server_config = match core.ca.server_config(&leaf, vec![b"http/1.1".to_vec()]) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, host = %sni, "leaf server config failed");
            return Ok(());
        }
    };
    let client_tls = match start.into_stream(server_config).await {
        Ok(tls) => tls,
        Err(error) => {
            tracing::error!(%error, "client handshake failed");
            return Ok(());
        }
    };
    ctx.client().set_negotiated_protocol("http/1.1");

    let plan = DialPlan::TlsMirror {
        connect_head: head.clone(),
        authority: head.target.clone(),
    };
    serve_intercepted_h1(
        core,
        ctx,
        session,
        client_tls,
        Some(plan),
        head.target.clone(),
    )
    .await
}

/// Request loop over an intercepted client-side stream (TLS in practice).
async fn serve_intercepted_h1<C>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    session: &mut Option<ServerSession>,
    client_io: C,
    plan: Option<DialPlan>,
    fallback_authority: String,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut stream = PeekableStream::new(client_io);
    loop {
        let raw = match stream
            .read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES)
            .await?
        {
            None => return Ok(()),
            Some(raw) => raw,
        };
        let request_head = parse_request_head(&raw)?;

        if request_head.is_websocket_upgrade() {
            return websocket::passthrough(core, &request_head, &mut stream).await;
        }

        let outcome = pipeline::run_h1(
            core,
            ctx,
            session,
            plan.clone(),
            &mut stream,
            request_head,
            "https",
            Some(&fallback_authority),
        )
        .await;
        if outcome.close_client {
            return Ok(());
        }
    }
}

/// HTTP/2 dispatch after the splice: an h2 server on the client TLS stream,
/// one child task per stream, all multiplexed onto the existing upstream
/// HTTP/2 connection. Cancels when the client close notification fires.
async fn serve_h2_connection<C, U>(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    client_tls: C,
    upstream_tls: U,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = H2Handle::handshake(upstream_tls).await?;

    let mut builder = h2::server::Builder::new();
    builder.max_concurrent_streams(H2_MAX_CONCURRENT_STREAMS);
    let mut connection = builder.handshake(client_tls).await.map_err(h2_to_io)?;

    let mut close_notification = ctx.client().close_notification();
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            changed = close_notification.changed() => {
                if changed.is_err() || *close_notification.borrow() {
                    streams.abort_all();
                    break;
                }
            }
            accepted = connection.accept() => match accepted {
                None => break,
                Some(Err(error)) => {
                    tracing::debug!(error = %error, "client HTTP/2 accept ended");
                    break;
                }
                Some(Ok((request, respond))) => {
                    streams.spawn(run_h2_stream(
                        Arc::clone(core),
                        Arc::clone(ctx),
                        handle.sender(),
                        request,
                        respond,
                    ));
                }
            }
        }
    }
    while streams.join_next().await.is_some() {}
    Ok(())
}

async fn reply_connect_error<S>(
    client_stream: &mut PeekableStream<S>,
    error: &io::Error,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if error.to_string().contains("Proxy Authentication Required") {
        return write_simple_response(
            client_stream,
            407,
            "",
            &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
        )
        .await;
    }
    write_simple_response(client_stream, 502, "", &[]).await
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|digit| digit.is_ascii_digit()) => host,
        _ => authority,
    }
}
