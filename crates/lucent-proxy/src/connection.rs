use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use lucent_tls::ClientHelloSummary;
use tokio::sync::watch;
use uuid::Uuid;

/// One accepted TCP connection from a client. Shared metadata only; the
/// socket itself is owned by the connection handler task.
pub struct ClientConn {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    tls: AtomicBool,
    upstream_cert: AtomicBool,
    negotiated_protocol: Mutex<String>,
    client_hello: Mutex<Option<ClientHelloSummary>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl ClientConn {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            tls: AtomicBool::new(false),
            upstream_cert: AtomicBool::new(true),
            negotiated_protocol: Mutex::new(String::new()),
            client_hello: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    pub fn tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tls(&self, tls: bool) {
        self.tls.store(tls, Ordering::Relaxed);
    }

    /// Whether the upstream is dialed before the client handshake so the
    /// forged certificate can mirror the upstream's negotiated protocol.
    pub fn upstream_cert(&self) -> bool {
        self.upstream_cert.load(Ordering::Relaxed)
    }

    pub fn set_upstream_cert(&self, upstream_cert: bool) {
        self.upstream_cert.store(upstream_cert, Ordering::Relaxed);
    }

    /// Empty until a client-side TLS handshake completes; then `http/1.1` or
    /// `h2`.
    pub fn negotiated_protocol(&self) -> String {
        self.negotiated_protocol
            .lock()
            .map(|protocol| protocol.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_negotiated_protocol(&self, protocol: &str) {
        if let Ok(mut guard) = self.negotiated_protocol.lock() {
            *guard = protocol.to_string();
        }
    }

    pub fn client_hello(&self) -> Option<ClientHelloSummary> {
        self.client_hello
            .lock()
            .ok()
            .and_then(|hello| hello.clone())
    }

    pub(crate) fn set_client_hello(&self, summary: ClientHelloSummary) {
        if let Ok(mut guard) = self.client_hello.lock() {
            *guard = Some(summary);
        }
    }

    /// Fires once when the connection is torn down.
    pub fn close_notification(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// First close wins; later calls are no-ops.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            let _ = self.close_tx.send(true);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The upstream side of a client connection.
pub struct ServerConn {
    pub id: Uuid,
    pub address: String,
    pub peer_addr: Option<SocketAddr>,
    negotiated_protocol: Mutex<String>,
    closed: AtomicBool,
}

impl ServerConn {
    pub(crate) fn new(address: String, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            peer_addr,
            negotiated_protocol: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn negotiated_protocol(&self) -> String {
        self.negotiated_protocol
            .lock()
            .map(|protocol| protocol.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_negotiated_protocol(&self, protocol: &str) {
        if let Ok(mut guard) = self.negotiated_protocol.lock() {
            *guard = protocol.to_string();
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Ties the client connection to its upstream counterpart for the lifetime
/// of the accepted connection.
pub struct ConnContext {
    client: std::sync::Arc<ClientConn>,
    server: Mutex<Option<std::sync::Arc<ServerConn>>>,
    intercept: AtomicBool,
    flow_count: AtomicU32,
    close_after_response: AtomicBool,
}

impl ConnContext {
    pub(crate) fn new(client: std::sync::Arc<ClientConn>) -> Self {
        Self {
            client,
            server: Mutex::new(None),
            intercept: AtomicBool::new(false),
            flow_count: AtomicU32::new(0),
            close_after_response: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &std::sync::Arc<ClientConn> {
        &self.client
    }

    pub fn server(&self) -> Option<std::sync::Arc<ServerConn>> {
        self.server.lock().ok().and_then(|server| server.clone())
    }

    pub(crate) fn set_server(&self, server: std::sync::Arc<ServerConn>) {
        if let Ok(mut guard) = self.server.lock() {
            *guard = Some(server);
        }
    }

    pub(crate) fn clear_server(&self) {
        if let Ok(mut guard) = self.server.lock() {
            *guard = None;
        }
    }

    /// Set once when the CONNECT decision is evaluated.
    pub fn intercept(&self) -> bool {
        self.intercept.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intercept(&self, intercept: bool) {
        self.intercept.store(intercept, Ordering::Relaxed);
    }

    /// Number of requests accepted on this connection so far.
    pub fn flow_count(&self) -> u32 {
        self.flow_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_flow_count(&self) -> u32 {
        self.flow_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Set when the upstream answered with `Connection: close`; the client
    /// side is torn down after the in-flight response is written.
    pub fn close_after_response(&self) -> bool {
        self.close_after_response.load(Ordering::Relaxed)
    }

    pub(crate) fn set_close_after_response(&self, close: bool) {
        self.close_after_response.store(close, Ordering::Relaxed);
    }
}
