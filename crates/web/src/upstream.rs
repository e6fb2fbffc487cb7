//! Upstream console socket.
//!
//! Opens the hypervisor's console WebSocket using a freshly issued ticket.
//! The ticket is consumed by the connect call and dropped with it.

use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::HypervisorConfig;
use crate::resolver::ResolvedCredential;
use crate::ticket::{truncate_body, ConsoleTarget, ConsoleTicket};
use vmrelay_common::{Error, Result};

/// Sub-protocol the hypervisor expects on its console socket
pub const UPSTREAM_PROTOCOL: &str = "binary";

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Console socket URL for a ticket
pub fn console_url(scheme: &str, cred: &ResolvedCredential, target: &ConsoleTarget, ticket: &ConsoleTicket) -> String {
    format!(
        "{}://{}:{}/api2/json/{}/vncwebsocket?port={}&vncticket={}",
        scheme,
        cred.host,
        cred.port,
        target.api_path(),
        ticket.port,
        urlencoding::encode(&ticket.ticket)
    )
}

/// Opens upstream console sockets
#[derive(Clone)]
pub struct UpstreamConnector {
    scheme: &'static str,
    connector: Option<Connector>,
}

impl UpstreamConnector {
    pub fn new(cfg: &HypervisorConfig) -> Self {
        if cfg.tls {
            ensure_crypto_provider();
        }
        let connector = (cfg.tls && !cfg.verify_tls).then(insecure_connector);
        Self {
            scheme: cfg.ws_scheme(),
            connector,
        }
    }

    /// Open the console socket, bounded by the credential's timeout
    pub async fn connect(
        &self,
        cred: &ResolvedCredential,
        target: &ConsoleTarget,
        ticket: ConsoleTicket,
    ) -> Result<UpstreamSocket> {
        let mut request = console_url(self.scheme, cred, target, &ticket)
            .into_client_request()
            .map_err(|e| Error::Transport(format!("invalid console URL: {e}")))?;
        drop(ticket);

        let auth = HeaderValue::from_str(&cred.authorization())
            .map_err(|_| Error::Configuration(format!("server {} has an invalid API token", cred.server_id)))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(UPSTREAM_PROTOCOL));

        debug!(server_id = cred.server_id, node = %target.node, vmid = target.vmid, "opening upstream console socket");

        let connect = connect_async_tls_with_config(request, None, true, self.connector.clone());
        let (socket, _response) = tokio::time::timeout(cred.timeout, connect)
            .await
            .map_err(|_| Error::Timeout {
                ms: cred.timeout.as_millis() as u64,
            })?
            .map_err(map_ws_error)?;

        Ok(socket)
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Http(response) => Error::Upstream {
            status: Some(response.status().as_u16()),
            body: response
                .body()
                .as_deref()
                .map(|b| truncate_body(String::from_utf8_lossy(b).into_owned()))
                .unwrap_or_default(),
        },
        other => Error::Transport(other.to_string()),
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Proxmox nodes ship self-signed certificates
fn insecure_connector() -> Connector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipVerification))
        .with_no_client_auth();
    Connector::Rustls(Arc::new(config))
}

#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vmrelay_common::{SecretCipher, ServerCredential, VmType};

    fn credential() -> ResolvedCredential {
        let db = vmrelay_common::Database::open_memory().unwrap();
        let cipher = SecretCipher::new("k").unwrap();
        let mut server = ServerCredential::new(1, "pve1", "10.0.0.5", 8006);
        server.token_id = "root@pam!broker".to_string();
        server.encrypted_secret = Some(cipher.encrypt("s"));
        db.upsert_server(&server).unwrap();
        crate::resolver::CredentialResolver::new(db, Some(cipher))
            .credential_for(&server)
            .unwrap()
    }

    #[test]
    fn test_console_url_encodes_ticket() {
        let target = ConsoleTarget {
            node: "pve1".to_string(),
            vmid: 100,
            vmtype: VmType::Qemu,
        };
        let ticket = ConsoleTicket {
            ticket: "PVEVNC:64F0::a+b/c=".to_string(),
            port: 5900,
            user: "root@pam".to_string(),
            upid: "UPID".to_string(),
        };
        let url = console_url("wss", &credential(), &target, &ticket);
        assert_eq!(
            url,
            "wss://10.0.0.5:8006/api2/json/nodes/pve1/qemu/100/vncwebsocket?port=5900&vncticket=PVEVNC%3A64F0%3A%3Aa%2Bb%2Fc%3D"
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cred = credential();
        cred.host = "127.0.0.1".to_string();
        cred.port = port;
        cred.timeout = Duration::from_secs(5);

        let connector = UpstreamConnector::new(&HypervisorConfig {
            tls: false,
            verify_tls: false,
        });
        let target = ConsoleTarget {
            node: "pve1".to_string(),
            vmid: 100,
            vmtype: VmType::Qemu,
        };
        let ticket = ConsoleTicket {
            ticket: "t".to_string(),
            port: 5900,
            user: "u".to_string(),
            upid: "p".to_string(),
        };
        let err = connector.connect(&cred, &target, ticket).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{err}");
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn test_verifying_tls_connect_fails_cleanly() {
        // Accepts the TCP connection but never answers the TLS handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut cred = credential();
        cred.host = "127.0.0.1".to_string();
        cred.port = port;
        cred.timeout = Duration::from_millis(300);

        let connector = UpstreamConnector::new(&HypervisorConfig {
            tls: true,
            verify_tls: true,
        });
        let target = ConsoleTarget {
            node: "pve1".to_string(),
            vmid: 100,
            vmtype: VmType::Qemu,
        };
        let ticket = ConsoleTicket {
            ticket: "t".to_string(),
            port: 5900,
            user: "u".to_string(),
            upid: "p".to_string(),
        };
        let result = tokio::spawn(async move { connector.connect(&cred, &target, ticket).await })
            .await
            .expect("connect must not panic");
        // Hosts without native roots fail before the handshake instead
        let err = result.unwrap_err();
        assert!(
            matches!(err, Error::Timeout { ms: 300 } | Error::Transport(_)),
            "{err}"
        );
        accept.abort();
    }

    #[test]
    fn test_handshake_rejection_body_is_capped() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(401)
            .body(Some(vec![b'x'; 64 * 1024]))
            .unwrap();
        match map_ws_error(tokio_tungstenite::tungstenite::Error::Http(response)) {
            Error::Upstream { status, body } => {
                assert_eq!(status, Some(401));
                assert!(body.len() <= crate::ticket::MAX_ERROR_BODY);
                assert!(body.starts_with("xxx"));
            }
            other => panic!("unexpected {other}"),
        }
    }
}
