use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use http::Uri;
use lucent_http::{host_with_default_port, HostMatcher, RequestHead};

use crate::ProxyError;

pub const DEFAULT_STREAM_LARGE_BODIES: usize = 5 * 1024 * 1024;

/// Decides per CONNECT request whether the tunnel is intercepted or relayed
/// opaquely.
pub type InterceptRule = Arc<dyn Fn(&RequestHead) -> bool + Send + Sync>;

/// Resolves the upstream proxy URL for the original client request. `None`
/// means a direct connection.
pub type UpstreamResolver = Arc<dyn Fn(&RequestHead) -> io::Result<Option<Uri>> + Send + Sync>;

/// Validates proxy credentials on a request; the error text is logged.
pub type ProxyAuthenticator = Arc<dyn Fn(&RequestHead) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind string, e.g. `:9080` or `127.0.0.1:9080`. An empty string binds
    /// the default HTTP port.
    pub addr: String,
    /// Body-buffering cutoff in bytes; bodies reaching it are streamed.
    pub stream_large_bodies: usize,
    /// Skip verification of upstream server certificates.
    pub insecure_skip_verify: bool,
    /// Forced upstream proxy URL; `None` falls back to the resolver or the
    /// proxy environment variables.
    pub upstream: Option<String>,
    /// Directory for root certificate persistence; `None` keeps the root in
    /// memory only.
    pub ca_root_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
            insecure_skip_verify: false,
            upstream: None,
            ca_root_path: None,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.stream_large_bodies == 0 {
            return Err(ProxyError::InvalidConfig(
                "stream_large_bodies must be greater than zero".to_string(),
            ));
        }
        if let Some(upstream) = &self.upstream {
            let uri = upstream.parse::<Uri>().map_err(|error| {
                ProxyError::InvalidConfig(format!("upstream URL {upstream} is invalid: {error}"))
            })?;
            if uri.host().is_none() {
                return Err(ProxyError::InvalidConfig(format!(
                    "upstream URL {upstream} has no host"
                )));
            }
        }
        Ok(())
    }

    /// The address handed to the TCP listener. A bare `:port` (or `:http`)
    /// binds every interface, mirroring the usual proxy bind string.
    pub(crate) fn bind_addr(&self) -> String {
        if self.addr.is_empty() {
            return "0.0.0.0:80".to_string();
        }
        match self.addr.strip_prefix(':') {
            Some("http") => "0.0.0.0:80".to_string(),
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.addr.clone(),
        }
    }

    pub(crate) fn parsed_upstream(&self) -> Option<Uri> {
        self.upstream
            .as_ref()
            .and_then(|upstream| upstream.parse::<Uri>().ok())
    }
}

/// Intercept everything except hosts on the list.
pub fn intercept_ignoring<I, P>(hosts: I) -> InterceptRule
where
    I: IntoIterator<Item = P>,
    P: Into<String>,
{
    let matcher = HostMatcher::new(hosts);
    Arc::new(move |request: &RequestHead| {
        let Some(host) = request.host() else {
            return true;
        };
        !matcher.matches(&host_with_default_port(&host, 443))
    })
}

/// Intercept only hosts on the list.
pub fn intercept_allowing<I, P>(hosts: I) -> InterceptRule
where
    I: IntoIterator<Item = P>,
    P: Into<String>,
{
    let matcher = HostMatcher::new(hosts);
    Arc::new(move |request: &RequestHead| {
        let Some(host) = request.host() else {
            return false;
        };
        matcher.matches(&host_with_default_port(&host, 443))
    })
}

#[cfg(test)]
mod tests {
    use lucent_http::parse_request_head;

    use super::{intercept_allowing, intercept_ignoring, ProxyConfig};

    #[test]
    fn default_config_validates() {
        ProxyConfig::default().validate().expect("default config");
    }

    #[test]
    fn zero_stream_threshold_is_rejected() {
        let config = ProxyConfig {
            stream_large_bodies: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_upstream_is_rejected() {
        let config = ProxyConfig {
            upstream: Some("::bad::".to_string()),
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bind_addr_normalizes_bare_ports() {
        let config = ProxyConfig {
            addr: ":9080".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:9080");

        let config = ProxyConfig {
            addr: "127.0.0.1:9080".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:9080");

        assert_eq!(ProxyConfig::default().bind_addr(), "0.0.0.0:80");
    }

    #[test]
    fn ignore_and_allow_rules_use_the_host_grammar() {
        let connect = parse_request_head(b"CONNECT secure.bank.example:443 HTTP/1.1\r\n\r\n")
            .expect("parse connect head");

        let ignore = intercept_ignoring(["*.bank.example"]);
        assert!(!ignore(&connect));

        let allow = intercept_allowing(["*.bank.example"]);
        assert!(allow(&connect));

        let allow_other = intercept_allowing(["api.example.com"]);
        assert!(!allow_other(&connect));
    }
}
