mod common;

use std::sync::Arc;

use common::{
    connect_and_handshake_with_alpn, default_config, pin_direct_upstream, read_response_full,
    spawn_h2_tls_upstream, start_proxy, Recorder, RecorderAddon,
};
use lucent_proxy::{Proxy, UpstreamCertAddon};
use tokio::io::AsyncWriteExt;

async fn proxy_with_recorder() -> (Arc<Proxy>, Arc<Recorder>) {
    let proxy = Arc::new(Proxy::new(default_config()).expect("build proxy"));
    pin_direct_upstream(&proxy);
    let recorder = Arc::new(Recorder::default());
    proxy.add_addon(Arc::new(RecorderAddon(Arc::clone(&recorder))));
    (proxy, recorder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_h2_is_mirrored_to_the_client() {
    let (upstream_addr, _upstream) = spawn_h2_tls_upstream().await;
    let (proxy, _recorder) = proxy_with_recorder().await;
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let tls = connect_and_handshake_with_alpn(
        proxy_addr,
        &upstream_addr.to_string(),
        &root_pem,
        vec![b"h2".to_vec(), b"http/1.1".to_vec()],
    )
    .await;
    assert_eq!(
        tls.get_ref().1.alpn_protocol(),
        Some(b"h2".as_slice()),
        "forged certificate must present the upstream's negotiated protocol"
    );

    let (mut sender, connection) = h2::client::handshake(tls).await.expect("client h2 handshake");
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("GET")
        .uri(format!("https://{upstream_addr}/"))
        .body(())
        .expect("build h2 request");
    let mut ready = sender.ready().await.expect("h2 sender ready");
    let (response, _send) = ready.send_request(request, true).expect("send h2 request");
    let response = response.await.expect("h2 response");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("protocol")
            .and_then(|value| value.to_str().ok()),
        Some("h2")
    );

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("h2 body chunk");
        collected.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    assert_eq!(collected, b"ok");

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_mode_forces_http1_and_bridges_to_h2_upstream() {
    let (upstream_addr, _upstream) = spawn_h2_tls_upstream().await;
    let (proxy, _recorder) = proxy_with_recorder().await;
    proxy.add_addon(Arc::new(UpstreamCertAddon::new(false)));
    let root_pem = proxy.root_ca_pem();
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut tls = connect_and_handshake_with_alpn(
        proxy_addr,
        &upstream_addr.to_string(),
        &root_pem,
        vec![b"h2".to_vec(), b"http/1.1".to_vec()],
    )
    .await;
    assert_eq!(
        tls.get_ref().1.alpn_protocol(),
        Some(b"http/1.1".as_slice()),
        "lazy interception only ever offers http/1.1"
    );

    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .expect("send intercepted request");
    let (status, head, body) = read_response_full(&mut tls).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");
    assert!(
        head.to_ascii_lowercase().contains("protocol: h2"),
        "response must come from the HTTP/2 upstream: {head}"
    );

    proxy.close();
}
