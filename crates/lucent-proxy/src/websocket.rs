use std::io;
use std::sync::Arc;

use lucent_http::{host_with_default_port, PeekableStream, RequestHead};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::entry::ProxyCore;
use crate::pipeline::{log_transport_error, write_simple_response};

/// WebSocket passthrough on an intercepted connection: replay the upgrade
/// head to a fresh TLS connection to the target and relay bytes both ways.
pub(crate) async fn passthrough<S>(
    core: &Arc<ProxyCore>,
    head: &RequestHead,
    client: &mut PeekableStream<S>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(host) = head.host() else {
        return write_simple_response(client, 502, "", &[]).await;
    };
    let target = host_with_default_port(&host, 443);
    let bare_host = match target.rsplit_once(':') {
        Some((bare, _)) => bare.to_string(),
        None => target.clone(),
    };

    let upstream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, host = %target, "websocket upstream dial failed");
            return write_simple_response(client, 502, "", &[]).await;
        }
    };
    let Ok(server_name) = ServerName::try_from(bare_host) else {
        return write_simple_response(client, 502, "", &[]).await;
    };
    let config = lucent_tls::upstream_client_config(core.config.insecure_skip_verify, Vec::new());
    let mut upstream_tls = match TlsConnector::from(config)
        .connect(server_name, upstream)
        .await
    {
        Ok(tls) => tls,
        Err(error) => {
            tracing::error!(%error, host = %target, "websocket upstream handshake failed");
            return write_simple_response(client, 502, "", &[]).await;
        }
    };

    upstream_tls.write_all(&head.encode()).await?;
    if let Err(error) = tokio::io::copy_bidirectional(client, &mut upstream_tls).await {
        log_transport_error(&error);
    }
    Ok(())
}
