use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, KeyLogFile, RootCertStore, SignatureScheme};

/// The ClientHello fields the splice mirrors onto the upstream handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloSummary {
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub cipher_suites: Vec<u16>,
}

impl ClientHelloSummary {
    pub fn from_client_hello(client_hello: &rustls::server::ClientHello<'_>) -> Self {
        let alpn_protocols = client_hello
            .alpn()
            .map(|protocols| protocols.map(|protocol| protocol.to_vec()).collect())
            .unwrap_or_default();
        let cipher_suites = client_hello
            .cipher_suites()
            .iter()
            .map(|suite| u16::from(*suite))
            .collect();
        Self {
            server_name: client_hello.server_name().map(ToOwned::to_owned),
            alpn_protocols,
            cipher_suites,
        }
    }
}

/// Upstream-facing client config. The key-log sink appends negotiated
/// secrets to `SSLKEYLOGFILE` when the variable is set.
pub fn upstream_client_config(
    insecure_skip_verify: bool,
    alpn_protocols: Vec<Vec<u8>>,
) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = alpn_protocols;
    config.key_log = Arc::new(KeyLogFile::new());
    Arc::new(config)
}

/// Client config mirroring a captured ClientHello: the ALPN offer is
/// forwarded verbatim so the upstream negotiates the protocol the client
/// asked for. Cipher suites and protocol versions stay at the rustls
/// supported sets.
pub fn mirrored_client_config(
    client_hello: &ClientHelloSummary,
    insecure_skip_verify: bool,
) -> Arc<ClientConfig> {
    upstream_client_config(insecure_skip_verify, client_hello.alpn_protocols.clone())
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
