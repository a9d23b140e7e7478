use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lucent_http::{parse_request_head, BodyMode, Headers, HttpVersion, PeekableStream,
    ResponseHead, MAX_HEAD_BYTES,
};
use lucent_tls::{CaConfig, CertificateAuthority, IssuedLeaf};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

use crate::addon::{
    dispatch_client_connected, dispatch_client_disconnected, guard_hook, Addon, AddonRegistry,
};
use crate::client::ServerSession;
use crate::config::{InterceptRule, ProxyAuthenticator, ProxyConfig, UpstreamResolver};
use crate::connection::{ClientConn, ConnContext};
use crate::flow::Response;
use crate::interceptor;
use crate::pipeline::{self, close_server_session, write_simple_response, DialPlan};
use crate::upstream::UpstreamManager;
use crate::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Run,
    Graceful,
    Force,
}

/// Shared state every connection task sees.
pub(crate) struct ProxyCore {
    pub(crate) config: ProxyConfig,
    pub(crate) registry: AddonRegistry,
    pub(crate) upstream_manager: UpstreamManager,
    pub(crate) ca: CertificateAuthority,
    should_intercept: RwLock<Option<InterceptRule>>,
    auth: RwLock<Option<ProxyAuthenticator>>,
    stop_tx: watch::Sender<StopMode>,
    stopped: Notify,
}

impl ProxyCore {
    pub(crate) fn should_intercept(&self) -> Option<InterceptRule> {
        self.should_intercept
            .read()
            .ok()
            .and_then(|rule| rule.clone())
    }

    fn auth(&self) -> Option<ProxyAuthenticator> {
        self.auth.read().ok().and_then(|auth| auth.clone())
    }
}

/// The proxy server: accepts connections, routes CONNECT versus forward
/// proxy versus direct requests, and owns the shared addon registry, CA, and
/// upstream manager.
pub struct Proxy {
    core: Arc<ProxyCore>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let ca = CertificateAuthority::new(CaConfig {
            root_path: config.ca_root_path.clone(),
            ..CaConfig::default()
        })?;
        let upstream_manager =
            UpstreamManager::new(config.parsed_upstream(), config.insecure_skip_verify);
        let (stop_tx, _) = watch::channel(StopMode::Run);
        Ok(Self {
            core: Arc::new(ProxyCore {
                config,
                registry: AddonRegistry::new(),
                upstream_manager,
                ca,
                should_intercept: RwLock::new(None),
                auth: RwLock::new(None),
                stop_tx,
                stopped: Notify::new(),
            }),
        })
    }

    /// Registers an addon; dispatch order follows registration order.
    pub fn add_addon(&self, addon: Arc<dyn Addon>) {
        self.core.registry.add(addon);
    }

    pub fn set_should_intercept(&self, rule: InterceptRule) {
        if let Ok(mut guard) = self.core.should_intercept.write() {
            *guard = Some(rule);
        }
    }

    pub fn set_upstream_resolver(&self, resolver: UpstreamResolver) {
        self.core.upstream_manager.set_resolver(resolver);
    }

    pub fn set_proxy_auth(&self, auth: ProxyAuthenticator) {
        if let Ok(mut guard) = self.core.auth.write() {
            *guard = Some(auth);
        }
    }

    /// Root certificate PEM, for trust-store installation.
    pub fn root_ca_pem(&self) -> String {
        self.core.ca.root_ca_pem().to_string()
    }

    /// Mints (or returns the cached) leaf for a common name.
    pub fn certificate_for(&self, common_name: &str) -> Result<Arc<IssuedLeaf>, ProxyError> {
        Ok(self.core.ca.get_cert(common_name)?)
    }

    /// Binds the configured address and serves until `close` or `shutdown`.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.core.config.bind_addr()).await?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "proxy listening");
        }
        self.serve(listener).await
    }

    /// Serves on an already-bound listener; used when the caller needs the
    /// ephemeral port before starting.
    pub async fn start_with_listener(&self, listener: TcpListener) -> Result<(), ProxyError> {
        self.serve(listener).await
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let mut stop_rx = self.core.stop_tx.subscribe();
        let mut tasks = JoinSet::new();

        let stop_mode = loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break StopMode::Force;
                    }
                    let mode = *stop_rx.borrow();
                    if mode != StopMode::Run {
                        break mode;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let core = Arc::clone(&self.core);
                        tasks.spawn(serve_connection(core, stream, peer));
                        while tasks.try_join_next().is_some() {}
                    }
                    Err(error) => {
                        tracing::error!(%error, "accept failed");
                    }
                }
            }
        };
        drop(listener);

        if stop_mode == StopMode::Force {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        self.core.stopped.notify_waiters();
        Ok(())
    }

    /// Tears down immediately: stops accepting and aborts every connection.
    pub fn close(&self) {
        let _ = self.core.stop_tx.send(StopMode::Force);
    }

    /// Stops accepting and waits for in-flight connections up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ProxyError> {
        let stopped = self.core.stopped.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        let _ = self.core.stop_tx.send(StopMode::Graceful);
        tokio::time::timeout(timeout, stopped)
            .await
            .map_err(|_| ProxyError::ShutdownTimeout)
    }
}

async fn serve_connection(core: Arc<ProxyCore>, stream: TcpStream, peer: SocketAddr) {
    let client = Arc::new(ClientConn::new(peer));
    let ctx = Arc::new(ConnContext::new(Arc::clone(&client)));
    dispatch_client_connected(&core.registry, &client);

    let mut stream = PeekableStream::new(stream);
    let mut session: Option<ServerSession> = None;
    if let Err(error) = serve_http1(&core, &ctx, &mut stream, &mut session).await {
        pipeline::log_transport_error(&error);
    }
    drop(stream);

    // Client side first: this path runs when the client closed or the serve
    // loop decided to stop; upstream teardown inside the pipeline already
    // handled the server-initiated ordering.
    if client.mark_closed() {
        dispatch_client_disconnected(&core.registry, &client);
    }
    close_server_session(&core, &ctx, &mut session);
}

/// Per-request router: proxy auth, CONNECT, absolute-form forward proxy,
/// and direct requests to the proxy itself.
async fn serve_http1(
    core: &Arc<ProxyCore>,
    ctx: &Arc<ConnContext>,
    stream: &mut PeekableStream<TcpStream>,
    session: &mut Option<ServerSession>,
) -> io::Result<()> {
    loop {
        let raw = match stream
            .read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES)
            .await?
        {
            None => return Ok(()),
            Some(raw) => raw,
        };
        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(error) => {
                tracing::debug!(%error, "request head parse failed");
                return write_simple_response(stream, 400, "", &[]).await;
            }
        };

        if let Some(auth) = core.auth() {
            if let Err(reason) = auth(&head) {
                tracing::error!(%reason, "proxy authentication failed");
                write_simple_response(
                    stream,
                    407,
                    "",
                    &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
                )
                .await?;
                if head.body_mode()? != BodyMode::None {
                    return Ok(());
                }
                continue;
            }
        }

        if head.is_connect() {
            return interceptor::handle_connect(core, ctx, session, stream, head).await;
        }

        let is_forward_proxy = head
            .absolute_uri()
            .and_then(|uri| uri.host().map(|host| !host.is_empty()))
            .unwrap_or(false);
        if is_forward_proxy {
            let plan = DialPlan::PlainHttp { head: head.clone() };
            let outcome = pipeline::run_h1(
                core,
                ctx,
                session,
                Some(plan),
                stream,
                head,
                "http",
                None,
            )
            .await;
            if outcome.close_client {
                return Ok(());
            }
            continue;
        }

        // Direct request to the proxy server itself.
        let mut produced: Option<Response> = None;
        for addon in core.registry.get() {
            guard_hook("access_proxy_server", || {
                produced = addon.access_proxy_server(&head);
            });
            if produced.is_some() {
                break;
            }
        }
        match produced {
            Some(response) => write_addon_response(stream, response).await?,
            None => {
                write_simple_response(
                    stream,
                    400,
                    "This is a proxy server, direct requests are not allowed",
                    &[],
                )
                .await?;
            }
        }
        if head.body_mode()? != BodyMode::None {
            return Ok(());
        }
    }
}

async fn write_addon_response(
    stream: &mut PeekableStream<TcpStream>,
    response: Response,
) -> io::Result<()> {
    let body = response.body.unwrap_or_default();
    let mut headers = Headers::new();
    for header in response.headers.iter() {
        let lowered = header.name.to_ascii_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        headers.append(header.name.clone(), header.value.clone());
    }
    headers.append("Content-Length", body.len().to_string());

    let head = ResponseHead {
        version: HttpVersion::Http11,
        status: response.status_code,
        reason: http::StatusCode::from_u16(response.status_code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("")
            .to_string(),
        headers,
    };
    stream.write_all(&head.encode()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
