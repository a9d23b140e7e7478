use http::Uri;

/// Transport failures a proxy sees in normal operation; these are logged at
/// debug rather than error. Matching is by case-sensitive substring.
pub const NORMAL_CLOSE_ERRORS: &[&str] = &[
    "read: connection reset by peer",
    "write: broken pipe",
    "i/o timeout",
    "net/http: TLS handshake timeout",
    "io: read/write on closed pipe",
    "connect: connection refused",
    "connect: connection reset by peer",
    "use of closed network connection",
    "connection reset by peer",
    "broken pipe",
    "unexpected end of file",
];

pub fn is_normal_close_error(message: &str) -> bool {
    NORMAL_CLOSE_ERRORS
        .iter()
        .any(|candidate| message.contains(candidate))
}

pub fn default_scheme_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("https") => 443,
        Some("socks5") => 1080,
        _ => 80,
    }
}

/// The URI's host with a port, defaulting the port from the scheme.
pub fn canonical_addr(uri: &Uri) -> String {
    let host = uri.host().unwrap_or_default();
    let port = uri
        .port_u16()
        .unwrap_or_else(|| default_scheme_port(uri.scheme_str()));
    format!("{host}:{port}")
}

/// Appends `default_port` when `host` carries none. Bracketed IPv6 literals
/// keep their brackets.
pub fn host_with_default_port(host: &str, default_port: u16) -> String {
    if host.starts_with('[') {
        if host.rfind(':').is_some_and(|index| index > host.rfind(']').unwrap_or(0)) {
            return host.to_string();
        }
        return format!("{host}:{default_port}");
    }
    if host.contains(':') {
        return host.to_string();
    }
    format!("{host}:{default_port}")
}

/// TLS record signature check on the first three bytes of a connection:
/// handshake record, protocol major 3, minor at most 3.
pub fn is_tls_client_hello(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0x16 && bytes[1] == 0x03 && bytes[2] <= 0x03
}

#[cfg(test)]
mod tests {
    use http::Uri;

    use super::{
        canonical_addr, host_with_default_port, is_normal_close_error, is_tls_client_hello,
    };

    #[test]
    fn canonical_addr_defaults_ports_by_scheme() {
        let http = "http://example.com/path".parse::<Uri>().expect("parse uri");
        assert_eq!(canonical_addr(&http), "example.com:80");

        let https = "https://example.com/".parse::<Uri>().expect("parse uri");
        assert_eq!(canonical_addr(&https), "example.com:443");

        let socks = "socks5://example.com".parse::<Uri>().expect("parse uri");
        assert_eq!(canonical_addr(&socks), "example.com:1080");

        let explicit = "http://example.com:8080/".parse::<Uri>().expect("parse uri");
        assert_eq!(canonical_addr(&explicit), "example.com:8080");
    }

    #[test]
    fn tls_record_signature() {
        assert!(is_tls_client_hello(&[0x16, 0x03, 0x03, 0x00]));
        assert!(is_tls_client_hello(&[0x16, 0x03, 0x01]));
        assert!(!is_tls_client_hello(&[0x15, 0x03, 0x03]));
        assert!(!is_tls_client_hello(&[0x16, 0x02, 0x03]));
        assert!(!is_tls_client_hello(&[0x16, 0x03, 0x04]));
        assert!(!is_tls_client_hello(&[0x16, 0x03]));
    }

    #[test]
    fn normal_close_errors_match_by_substring() {
        assert!(is_normal_close_error(
            "write tcp 127.0.0.1:9080: write: broken pipe"
        ));
        assert!(is_normal_close_error("dial: i/o timeout"));
        assert!(!is_normal_close_error("certificate signed by unknown authority"));
    }

    #[test]
    fn host_port_defaulting() {
        assert_eq!(host_with_default_port("example.com", 443), "example.com:443");
        assert_eq!(host_with_default_port("example.com:8443", 443), "example.com:8443");
        assert_eq!(host_with_default_port("[::1]", 443), "[::1]:443");
        assert_eq!(host_with_default_port("[::1]:8443", 443), "[::1]:8443");
    }
}
