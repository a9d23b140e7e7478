#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lucent_proxy::{Addon, ClientConn, ConnContext, Flow, Proxy, ProxyConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Records addon hook invocations in order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("recorder lock").clone()
    }

    pub fn push(&self, event: &str) {
        self.events.lock().expect("recorder lock").push(event.to_string());
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|seen| seen == event)
    }

    pub fn nth_position(&self, event: &str, n: usize) -> Option<usize> {
        self.events()
            .iter()
            .enumerate()
            .filter(|(_, seen)| seen.as_str() == event)
            .map(|(index, _)| index)
            .nth(n)
    }

    pub async fn wait_for(&self, event: &str) {
        for _ in 0..200 {
            if self.position(event).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {event} never fired; saw {:?}", self.events());
    }
}

pub struct RecorderAddon(pub Arc<Recorder>);

impl Addon for RecorderAddon {
    fn client_connected(&self, _client: &Arc<ClientConn>) {
        self.0.push("client_connected");
    }

    fn client_disconnected(&self, _client: &Arc<ClientConn>) {
        self.0.push("client_disconnected");
    }

    fn server_connected(&self, _conn: &Arc<ConnContext>) {
        self.0.push("server_connected");
    }

    fn server_disconnected(&self, _conn: &Arc<ConnContext>) {
        self.0.push("server_disconnected");
    }

    fn tls_established_server(&self, _conn: &Arc<ConnContext>) {
        self.0.push("tls_established_server");
    }

    fn request_headers(&self, _flow: &mut Flow) {
        self.0.push("request_headers");
    }

    fn request(&self, _flow: &mut Flow) {
        self.0.push("request");
    }

    fn response_headers(&self, _flow: &mut Flow) {
        self.0.push("response_headers");
    }

    fn response(&self, _flow: &mut Flow) {
        self.0.push("response");
    }
}

/// Starts a proxy on an ephemeral port. The returned task runs the accept
/// loop until the proxy is closed.
pub async fn start_proxy(proxy: Arc<Proxy>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy local addr");
    let task = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move {
            let _ = proxy.start_with_listener(listener).await;
        }
    });
    (addr, task)
}

/// Keeps upstream resolution hermetic: never consult the proxy environment
/// variables of the machine running the tests.
pub fn pin_direct_upstream(proxy: &Proxy) {
    proxy.set_upstream_resolver(Arc::new(|_| Ok(None)));
}

pub fn default_config() -> ProxyConfig {
    ProxyConfig {
        insecure_skip_verify: true,
        ..ProxyConfig::default()
    }
}

/// Minimal plain-HTTP upstream answering every request with `ok`.
pub async fn spawn_http_upstream(close_after_response: bool) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream listener");
    let addr = listener.local_addr().expect("upstream local addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_upstream_connection(stream, close_after_response));
        }
    });
    (addr, task)
}

async fn serve_upstream_connection<S>(mut stream: S, close_after_response: bool)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if read_head(&mut stream).await.is_none() {
            return;
        }
        let response = if close_after_response {
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
        } else {
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
        };
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if close_after_response {
            return;
        }
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        if head.windows(4).any(|window| window == b"\r\n\r\n") {
            return Some(head);
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(read) => head.extend_from_slice(&chunk[..read]),
        }
    }
}

/// TLS upstream with a self-signed certificate for 127.0.0.1, answering
/// every request with `ok` over HTTP/1.1.
pub async fn spawn_tls_upstream() -> (SocketAddr, JoinHandle<()>) {
    let key = rcgen::KeyPair::generate().expect("generate upstream key");
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("leaf params");
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().expect("ip")));
    let cert = params.self_signed(&key).expect("self-sign upstream cert");

    let chain = vec![cert.der().clone()];
    let private_key = rustls::pki_types::PrivateKeyDer::from(
        rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()),
    );
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .expect("upstream server config");
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind tls upstream");
    let addr = listener.local_addr().expect("tls upstream addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                serve_upstream_connection(tls, false).await;
            });
        }
    });
    (addr, task)
}

/// TLS upstream speaking HTTP/2 only (ALPN `h2`), answering every stream
/// with 200, a `protocol: h2` header, and the body `ok`.
pub async fn spawn_h2_tls_upstream() -> (SocketAddr, JoinHandle<()>) {
    let key = rcgen::KeyPair::generate().expect("generate upstream key");
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("leaf params");
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().expect("ip")));
    let cert = params.self_signed(&key).expect("self-sign upstream cert");

    let chain = vec![cert.der().clone()];
    let private_key = rustls::pki_types::PrivateKeyDer::from(
        rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()),
    );
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .expect("upstream server config");
    config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind h2 upstream");
    let addr = listener.local_addr().expect("h2 upstream addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let Ok(mut connection) = h2::server::handshake(tls).await else {
                    return;
                };
                while let Some(Ok((_request, mut respond))) = connection.accept().await {
                    let response = http::Response::builder()
                        .status(200)
                        .header("protocol", "h2")
                        .body(())
                        .expect("build upstream response");
                    let Ok(mut send) = respond.send_response(response, false) else {
                        continue;
                    };
                    let _ = send.send_data(bytes::Bytes::from_static(b"ok"), true);
                }
            });
        }
    });
    (addr, task)
}

/// Reads one complete response (status line, headers, content-length body)
/// and returns (status, body).
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (u16, String) {
    let (status, _, body) = read_response_full(stream).await;
    (status, body)
}

/// Like `read_response`, but also returns the raw head text for header
/// assertions.
pub async fn read_response_full<S: AsyncRead + Unpin>(stream: &mut S) -> (u16, String, String) {
    let mut data = Vec::new();
    let mut chunk = [0_u8; 1024];
    let header_end = loop {
        if let Some(position) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut chunk).await.expect("read response");
        assert!(read > 0, "connection closed before response head");
        data.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|status| status.parse::<u16>().ok())
        .expect("status code in response");
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while data.len() < header_end + content_length {
        let read = stream.read(&mut chunk).await.expect("read response body");
        assert!(read > 0, "connection closed before response body");
        data.extend_from_slice(&chunk[..read]);
    }
    let body = String::from_utf8_lossy(&data[header_end..header_end + content_length]).to_string();
    (status, head, body)
}

/// Opens a TLS session through the proxy's CONNECT tunnel, trusting the
/// proxy root certificate.
pub async fn connect_and_handshake(
    proxy_addr: SocketAddr,
    target: &str,
    root_pem: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    connect_and_handshake_with_alpn(proxy_addr, target, root_pem, Vec::new()).await
}

/// CONNECT tunnel + TLS handshake with an explicit ALPN offer.
pub async fn connect_and_handshake_with_alpn(
    proxy_addr: SocketAddr,
    target: &str,
    root_pem: &str,
    alpn_protocols: Vec<Vec<u8>>,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("send CONNECT");

    let mut established = Vec::new();
    let mut byte = [0_u8; 1];
    while !established.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read CONNECT reply");
        assert!(read > 0, "proxy closed during CONNECT");
        established.push(byte[0]);
    }
    let reply = String::from_utf8_lossy(&established);
    assert!(
        reply.starts_with("HTTP/1.1 200 Connection Established"),
        "unexpected CONNECT reply: {reply}"
    );

    use rustls::pki_types::pem::PemObject;
    let root = rustls::pki_types::CertificateDer::from_pem_slice(root_pem.as_bytes())
        .expect("parse proxy root certificate");
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root).expect("add proxy root");
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols;

    let host = target.rsplit_once(':').map(|(host, _)| host).unwrap_or(target);
    let server_name =
        rustls::pki_types::ServerName::try_from(host.to_string()).expect("server name");
    tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .expect("client TLS handshake with forged certificate")
}
