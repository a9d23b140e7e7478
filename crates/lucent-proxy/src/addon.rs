use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use lucent_http::RequestHead;

use crate::connection::{ClientConn, ConnContext};
use crate::flow::{BodyStream, Flow, Response};

/// Capability set observing and mutating proxy traffic. Every hook has a
/// no-op default; implement only what the addon cares about. Hooks run on
/// the connection's task, in registration order.
pub trait Addon: Send + Sync {
    /// A client opened a connection to the proxy. One connection can carry
    /// many flows.
    fn client_connected(&self, _client: &Arc<ClientConn>) {}

    /// The client connection closed, on either side's initiative.
    fn client_disconnected(&self, _client: &Arc<ClientConn>) {}

    /// The proxy connected to an upstream server.
    fn server_connected(&self, _conn: &Arc<ConnContext>) {}

    /// The upstream connection closed.
    fn server_disconnected(&self, _conn: &Arc<ConnContext>) {}

    /// The TLS handshake with the upstream server completed.
    fn tls_established_server(&self, _conn: &Arc<ConnContext>) {}

    /// Request headers are in; the body has not been read. Setting a
    /// response short-circuits the upstream exchange.
    fn request_headers(&self, _flow: &mut Flow) {}

    /// The whole request body was buffered. Not invoked for streamed bodies.
    fn request(&self, _flow: &mut Flow) {}

    /// Response headers are in; the body has not been read.
    fn response_headers(&self, _flow: &mut Flow) {}

    /// The whole response body was buffered. Not invoked for streamed bodies.
    fn response(&self, _flow: &mut Flow) {}

    /// Wraps the request body on its way upstream when the flow streams.
    fn stream_request_modifier<'a>(&self, _flow: &mut Flow, body: BodyStream<'a>) -> BodyStream<'a> {
        body
    }

    /// Wraps the response body on its way to the client when the flow
    /// streams.
    fn stream_response_modifier<'a>(
        &self,
        _flow: &mut Flow,
        body: BodyStream<'a>,
    ) -> BodyStream<'a> {
        body
    }

    /// A request addressed to the proxy itself rather than through it. The
    /// first addon returning a response answers it.
    fn access_proxy_server(&self, _request: &RequestHead) -> Option<Response> {
        None
    }
}

/// Ordered addon list. `get` hands out a snapshot so dispatch is stable
/// against concurrent registration.
#[derive(Default)]
pub struct AddonRegistry {
    addons: RwLock<Vec<Arc<dyn Addon>>>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, addon: Arc<dyn Addon>) {
        if let Ok(mut addons) = self.addons.write() {
            addons.push(addon);
        }
    }

    pub fn get(&self) -> Vec<Arc<dyn Addon>> {
        self.addons
            .read()
            .map(|addons| addons.clone())
            .unwrap_or_default()
    }
}

/// Runs an addon hook, converting a panic into a warning so one misbehaving
/// addon cannot take the connection down.
pub(crate) fn guard_hook(hook: &'static str, call: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!(hook, "recovered from addon panic");
    }
}

pub(crate) fn dispatch_client_connected(registry: &AddonRegistry, client: &Arc<ClientConn>) {
    for addon in registry.get() {
        guard_hook("client_connected", || addon.client_connected(client));
    }
}

pub(crate) fn dispatch_client_disconnected(registry: &AddonRegistry, client: &Arc<ClientConn>) {
    for addon in registry.get() {
        guard_hook("client_disconnected", || addon.client_disconnected(client));
    }
}

pub(crate) fn dispatch_server_connected(registry: &AddonRegistry, conn: &Arc<ConnContext>) {
    for addon in registry.get() {
        guard_hook("server_connected", || addon.server_connected(conn));
    }
}

pub(crate) fn dispatch_server_disconnected(registry: &AddonRegistry, conn: &Arc<ConnContext>) {
    for addon in registry.get() {
        guard_hook("server_disconnected", || addon.server_disconnected(conn));
    }
}

pub(crate) fn dispatch_tls_established_server(registry: &AddonRegistry, conn: &Arc<ConnContext>) {
    for addon in registry.get() {
        guard_hook("tls_established_server", || {
            addon.tls_established_server(conn)
        });
    }
}

/// Built-in traffic logger. Connection events log at info, request headers
/// at debug, and a summary line fires from the flow completion signal.
pub struct LogAddon;

impl Addon for LogAddon {
    fn client_connected(&self, client: &Arc<ClientConn>) {
        tracing::info!(remote_addr = %client.peer_addr, "client connected");
    }

    fn client_disconnected(&self, client: &Arc<ClientConn>) {
        tracing::info!(remote_addr = %client.peer_addr, "client disconnected");
    }

    fn server_connected(&self, conn: &Arc<ConnContext>) {
        let Some(server) = conn.server() else {
            return;
        };
        tracing::info!(
            client_addr = %conn.client().peer_addr,
            server_addr = %server.address,
            "server connected"
        );
    }

    fn server_disconnected(&self, conn: &Arc<ConnContext>) {
        let Some(server) = conn.server() else {
            return;
        };
        tracing::info!(
            client_addr = %conn.client().peer_addr,
            server_addr = %server.address,
            flow_count = conn.flow_count(),
            "server disconnected"
        );
    }

    fn request_headers(&self, flow: &mut Flow) {
        let client_addr = flow.conn_context().client().peer_addr;
        let method = flow.request.method.clone();
        let url = flow.request.url.to_string();
        tracing::debug!(%client_addr, method, url, "request headers");

        let completion = flow.completion();
        let start = Instant::now();
        tokio::spawn(async move {
            let outcome = completion.wait().await;
            tracing::info!(
                %client_addr,
                method,
                url,
                status = outcome.status_code.unwrap_or(0),
                content_length = outcome.body_len,
                duration_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );
        });
    }
}

/// Flips the per-connection upstream-cert mode, selecting lazy interception
/// instead of dial-first for every connection it sees.
pub struct UpstreamCertAddon {
    pub upstream_cert: bool,
}

impl UpstreamCertAddon {
    pub fn new(upstream_cert: bool) -> Self {
        Self { upstream_cert }
    }
}

impl Addon for UpstreamCertAddon {
    fn client_connected(&self, client: &Arc<ClientConn>) {
        client.set_upstream_cert(self.upstream_cert);
    }
}
