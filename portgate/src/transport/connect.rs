use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

trait ServerIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> ServerIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Everything needed to (re)open the RPC channel to the tunnel server.
///
/// Built once per agent so that certificate problems surface as fatal
/// configuration errors instead of retriable dial failures.
#[derive(Clone)]
pub struct ServerTransport {
    endpoint: Endpoint,
    dialer: Arc<ServerDialer>,
}

impl ServerTransport {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", server.addr))
            .map_err(|e| Error::Config(format!("invalid server address {}: {e}", server.addr)))?
            .connect_timeout(DIAL_TIMEOUT)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        let tls = if server.tls {
            let config = tls_config(server)?;
            let name = server_name(server.server_name())?;
            Some((TlsConnector::from(Arc::new(config)), name))
        } else {
            None
        };

        Ok(Self {
            endpoint,
            dialer: Arc::new(ServerDialer {
                addr: server.addr.clone(),
                tls,
            }),
        })
    }

    pub async fn connect(&self) -> Result<Channel> {
        let dialer = self.dialer.clone();
        self.endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let dialer = dialer.clone();
                async move { dialer.dial().await.map(TokioIo::new) }
            }))
            .await
            .map_err(Error::TransportDial)
    }
}

struct ServerDialer {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl ServerDialer {
    async fn dial(&self) -> io::Result<Box<dyn ServerIo>> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        configure_socket(&stream)?;
        debug!("Dialed tunnel server {}", self.addr);

        match &self.tls {
            None => Ok(Box::new(stream)),
            Some((connector, name)) => {
                let tls = connector.connect(name.clone(), stream).await?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Disables Nagle and enables TCP keep-alive probes on a fresh socket.
pub(crate) fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn tls_config(server: &ServerConfig) -> Result<ClientConfig> {
    let mut config = if let Some(path) = &server.tls_cert_file {
        ClientConfig::builder()
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth()
    } else if server.tls_insecure {
        warn!(
            "TLS certificate verification is disabled for {}; the connection is not authenticated",
            server.addr
        );
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = io::BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert =
            cert.map_err(|e| Error::Config(format!("malformed PEM in {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("rejected certificate in {}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Config(format!("invalid TLS server name '{host}': {e}")))
}

#[derive(Debug)]
struct NoCertificateVerification(CryptoProvider);

impl NoCertificateVerification {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_load_roots_rejects_empty_pem() {
        let path = std::env::temp_dir().join(format!("portgate-empty-{}.pem", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a certificate\n")
            .unwrap();

        let result = load_roots(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("tunnel.example.com").unwrap(),
            ServerName::DnsName(_)
        ));
    }

    #[test]
    fn test_insecure_transport_builds() {
        let server = ServerConfig {
            addr: "127.0.0.1:4443".into(),
            tls: true,
            tls_insecure: true,
            ..Default::default()
        };
        assert!(ServerTransport::new(&server).is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_dial_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ServerTransport::new(&ServerConfig {
            addr: addr.to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            transport.connect().await,
            Err(Error::TransportDial(_))
        ));
    }
}
