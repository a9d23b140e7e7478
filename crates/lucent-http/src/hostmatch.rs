/// Host pattern list with first-match-wins semantics. A pattern is an exact
/// `host:port`, a bare host (any port), or a `*.suffix` wildcard optionally
/// carrying a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMatcher {
    patterns: Vec<String>,
}

impl HostMatcher {
    pub fn new<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `address` is `host` or `host:port`.
    pub fn matches(&self, address: &str) -> bool {
        let (host, port) = split_host_port(address);
        self.patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, host, port))
    }
}

fn pattern_matches(pattern: &str, host: &str, port: Option<&str>) -> bool {
    let (pattern_host, pattern_port) = split_host_port(pattern);
    if let Some(pattern_port) = pattern_port {
        if port != Some(pattern_port) {
            return false;
        }
    }

    if let Some(suffix) = pattern_host.strip_prefix('*') {
        return host.len() > suffix.len() && host.ends_with(suffix);
    }
    host.eq_ignore_ascii_case(pattern_host)
}

fn split_host_port(address: &str) -> (&str, Option<&str>) {
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|digit| digit.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (address, None),
    }
}
