mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    default_config, pin_direct_upstream, read_response, spawn_http_upstream, start_proxy,
    Recorder, RecorderAddon,
};
use lucent_proxy::{Addon, BasicProxyAuth, Flow, Proxy, Response};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn proxy_with_recorder() -> (Arc<Proxy>, Arc<Recorder>) {
    let proxy = Arc::new(Proxy::new(default_config()).expect("build proxy"));
    pin_direct_upstream(&proxy);
    let recorder = Arc::new(Recorder::default());
    proxy.add_addon(Arc::new(RecorderAddon(Arc::clone(&recorder))));
    (proxy, recorder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forward_proxy_round_trip_with_event_order() {
    let (upstream_addr, _upstream) = spawn_http_upstream(false).await;
    let (proxy, recorder) = proxy_with_recorder().await;
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let request = format!(
        "GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("send request");

    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    drop(client);
    recorder.wait_for("client_disconnected").await;
    recorder.wait_for("server_disconnected").await;

    let events = recorder.events();
    for expected in [
        "client_connected",
        "request_headers",
        "server_connected",
        "request",
        "response_headers",
        "response",
        "client_disconnected",
        "server_disconnected",
    ] {
        assert!(
            events.iter().any(|event| event == expected),
            "missing {expected} in {events:?}"
        );
    }

    // Plain-HTTP forward proxying dials lazily: headers are seen first.
    let request_headers = recorder.position("request_headers").expect("request_headers");
    let server_connected = recorder.position("server_connected").expect("server_connected");
    assert!(request_headers < server_connected);

    // The client initiated the close.
    let client_disconnected = recorder
        .position("client_disconnected")
        .expect("client_disconnected");
    let server_disconnected = recorder
        .position("server_disconnected")
        .expect("server_disconnected");
    assert!(client_disconnected < server_disconnected);

    proxy.close();
}

struct InterceptRequestAddon;

impl Addon for InterceptRequestAddon {
    fn request(&self, flow: &mut Flow) {
        if flow.request.url.path() == "/intercept-request" {
            flow.response = Some(Response::with_text(200, "intercept-request"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_addon_short_circuits_without_dialing() {
    let (proxy, recorder) = proxy_with_recorder().await;
    proxy.add_addon(Arc::new(InterceptRequestAddon));
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    // The host does not resolve; a dial would fail with 502.
    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    client
        .write_all(
            b"GET http://unreachable.invalid/intercept-request HTTP/1.1\r\n\
              Host: unreachable.invalid\r\n\r\n",
        )
        .await
        .expect("send request");

    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "intercept-request");
    assert!(recorder.position("server_connected").is_none());

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_connection_close_orders_server_disconnect_first() {
    let (upstream_addr, _upstream) = spawn_http_upstream(true).await;
    let (proxy, recorder) = proxy_with_recorder().await;
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let request = format!(
        "GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("send request");

    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    recorder.wait_for("server_disconnected").await;
    recorder.wait_for("client_disconnected").await;
    let server_disconnected = recorder
        .position("server_disconnected")
        .expect("server_disconnected");
    let client_disconnected = recorder
        .position("client_disconnected")
        .expect("client_disconnected");
    assert!(server_disconnected < client_disconnected);

    // A fresh request still succeeds after the teardown.
    let mut second = TcpStream::connect(proxy_addr).await.expect("dial proxy again");
    second
        .write_all(request.as_bytes())
        .await
        .expect("send second request");
    let (status, body) = read_response(&mut second).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_requests_get_the_default_refusal() {
    let (proxy, _recorder) = proxy_with_recorder().await;
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: proxy.local\r\n\r\n")
        .await
        .expect("send request");

    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 400);
    assert_eq!(body, "This is a proxy server, direct requests are not allowed");

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_authentication_challenges_and_accepts() {
    let (upstream_addr, _upstream) = spawn_http_upstream(false).await;
    let (proxy, _recorder) = proxy_with_recorder().await;
    let auth = BasicProxyAuth::new("alice:secret|bob:hunter2").expect("parse credentials");
    proxy.set_proxy_auth(auth.into_authenticator());
    let (proxy_addr, _task) = start_proxy(Arc::clone(&proxy)).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let bare = format!(
        "GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client.write_all(bare.as_bytes()).await.expect("send request");
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 407);

    // Same connection retries with credentials, mirroring real clients.
    let authorized = format!(
        "GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\
         Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n"
    );
    client
        .write_all(authorized.as_bytes())
        .await
        .expect("send authorized request");
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    proxy.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_terminates_the_accept_loop() {
    let (proxy, _recorder) = proxy_with_recorder().await;
    let (_proxy_addr, task) = start_proxy(Arc::clone(&proxy)).await;

    proxy.close();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("accept loop exits after close")
        .expect("accept loop join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_idle_server() {
    let (proxy, _recorder) = proxy_with_recorder().await;
    let (_proxy_addr, task) = start_proxy(Arc::clone(&proxy)).await;

    proxy
        .shutdown(Duration::from_secs(2))
        .await
        .expect("graceful shutdown");
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("accept loop exits after shutdown")
        .expect("accept loop join");
}
