mod common;

use std::sync::Arc;

use common::{
    connect_and_handshake, default_config, pin_direct_upstream, read_response,
    spawn_http_upstream, spawn_tls_upstream, start_proxy, Recorder, RecorderAddon,
};
use lucent_proxy::{Proxy, UpstreamCertAddon};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn proxy_with_recorder() -> (Arc<Proxy>, Arc<Recorder>) {
    let proxy = Arc::new(Proxy::new(default_config()).expect("build proxy"));
    pin_direct_upstream(&proxy);
    let recorder = Arc::new(Recorder::default());
    proxy.add_addon(Arc::new(RecorderAddon(Arc::clone(&recorder))));
    (proxy, recorder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_first_interception_round_trip() {
    let (upstream_addr, _upstream) = spawn_tls_upstream().await;
    let (proxy, recorder) = proxy_with_recorder().await;
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut tls =
        connect_and_handshake(proxy_addr, &upstream_addr.to_string(), &root_pem).await;
    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .expect("send intercepted request");
    let (status, body) = read_response(&mut tls).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    recorder.wait_for("response").await;
    let events = recorder.events();
    assert!(
        events.iter().any(|event| event == "tls_established_server"),
        "missing tls_established_server in {events:?}"
    );

    // Dial-first: the upstream connection exists before any request headers.
    let server_connected = recorder.position("server_connected").expect("server_connected");
    let tls_established = recorder
        .position("tls_established_server")
        .expect("tls_established_server");
    let second_request_headers = recorder
        .nth_position("request_headers", 1)
        .expect("intercepted request headers");
    assert!(server_connected < second_request_headers);
    assert!(tls_established < second_request_headers);

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_interception_dials_on_first_request() {
    let (upstream_addr, _upstream) = spawn_tls_upstream().await;
    let (proxy, recorder) = proxy_with_recorder().await;
    proxy.add_addon(Arc::new(UpstreamCertAddon::new(false)));
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut tls =
        connect_and_handshake(proxy_addr, &upstream_addr.to_string(), &root_pem).await;
    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .expect("send intercepted request");
    let (status, body) = read_response(&mut tls).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    recorder.wait_for("response").await;

    // Lazy: the upstream dial happens after the intercepted request headers.
    let second_request_headers = recorder
        .nth_position("request_headers", 1)
        .expect("intercepted request headers");
    let server_connected = recorder.position("server_connected").expect("server_connected");
    let tls_established = recorder
        .position("tls_established_server")
        .expect("tls_established_server");
    assert!(second_request_headers < server_connected);
    assert!(server_connected < tls_established);

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opaque_tunnel_when_interception_is_declined() {
    let (upstream_addr, _upstream) = spawn_http_upstream(false).await;
    let (proxy, recorder) = proxy_with_recorder().await;
    proxy.set_should_intercept(Arc::new(|_| false));
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let connect = format!(
        "CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client
        .write_all(connect.as_bytes())
        .await
        .expect("send CONNECT");

    let mut established = Vec::new();
    let mut byte = [0_u8; 1];
    while !established.ends_with(b"\r\n\r\n") {
        let read = client.read(&mut byte).await.expect("read CONNECT reply");
        assert!(read > 0);
        established.push(byte[0]);
    }
    assert!(established.starts_with(b"HTTP/1.1 200 Connection Established"));

    // Plain bytes relay untouched through the tunnel.
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: tunnel\r\n\r\n")
        .await
        .expect("send tunneled request");
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    assert!(recorder.position("tls_established_server").is_none());
    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_tls_bytes_after_connect_fall_back_to_opaque_relay() {
    let (upstream_addr, _upstream) = spawn_http_upstream(false).await;
    let (proxy, recorder) = proxy_with_recorder().await;
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let connect = format!(
        "CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client
        .write_all(connect.as_bytes())
        .await
        .expect("send CONNECT");

    let mut established = Vec::new();
    let mut byte = [0_u8; 1];
    while !established.ends_with(b"\r\n\r\n") {
        let read = client.read(&mut byte).await.expect("read CONNECT reply");
        assert!(read > 0);
        established.push(byte[0]);
    }

    // Interception stays armed, but the peeked bytes are not a TLS record,
    // so no forged certificate is ever presented.
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: tunnel\r\n\r\n")
        .await
        .expect("send plain bytes");
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");
    assert!(recorder.position("tls_established_server").is_none());

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn intercepted_keep_alive_serves_sequential_requests() {
    let (upstream_addr, _upstream) = spawn_tls_upstream().await;
    let (proxy, _recorder) = proxy_with_recorder().await;
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut tls =
        connect_and_handshake(proxy_addr, &upstream_addr.to_string(), &root_pem).await;
    for _ in 0..3 {
        tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .expect("send intercepted request");
        let (status, body) = read_response(&mut tls).await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");
    }

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaf_certificates_are_cached_across_connections() {
    let (upstream_addr, _upstream) = spawn_tls_upstream().await;
    let (proxy, _recorder) = proxy_with_recorder().await;
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    for _ in 0..2 {
        let mut tls =
            connect_and_handshake(proxy_addr, &upstream_addr.to_string(), &root_pem).await;
        tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .expect("send intercepted request");
        let (status, _) = read_response(&mut tls).await;
        assert_eq!(status, 200);
    }

    let first = proxy.certificate_for("127.0.0.1").expect("cached leaf");
    let second = proxy.certificate_for("127.0.0.1").expect("cached leaf again");
    assert!(Arc::ptr_eq(&first, &second));

    proxy.close();
}
