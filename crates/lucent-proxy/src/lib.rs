mod addon;
mod auth;
mod client;
mod config;
mod connection;
mod entry;
mod flow;
mod interceptor;
mod pipeline;
mod upstream;
mod websocket;

pub use addon::{Addon, AddonRegistry, LogAddon, UpstreamCertAddon};
pub use auth::BasicProxyAuth;
pub use config::{
    intercept_allowing, intercept_ignoring, InterceptRule, ProxyAuthenticator, ProxyConfig,
    UpstreamResolver, DEFAULT_STREAM_LARGE_BODIES,
};
pub use connection::{ClientConn, ConnContext, ServerConn};
pub use entry::Proxy;
pub use flow::{
    BodyStream, BreakpointAction, BreakpointRule, Flow, FlowCompletion, FlowOutcome, Request,
    Response,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Ca(#[from] lucent_tls::CaError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("shutdown deadline elapsed")]
    ShutdownTimeout,
}

/// Byte streams crossing the proxy. Everything dialed or accepted is erased
/// to this so plain TCP, TLS, and proxied connections interchange.
pub(crate) trait Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;
