//! Direct QUIC dialer (§4.7): negotiates a single ALPN identifier, then
//! pins the peer's certificate SPKI against the pin store (C4) instead of
//! trusting a public CA chain.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use mesh_identity::CertificatePinStore;
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use tracing::{info, warn};

use super::{DialError, Dialer, DialerStats, DialerStatsSnapshot, DialerStream};

pub const ALPN: &[u8] = b"mesh-overlay";

/// Validates the server's certificate by SPKI pin instead of CA trust,
/// delegating to the shared pin store so TOFU/rotation logic lives in one
/// place (C4).
struct PinningVerifier {
    peer_id: String,
    pins: Arc<Mutex<CertificatePinStore>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl std::fmt::Debug for PinningVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinningVerifier").field("peer_id", &self.peer_id).finish()
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|e| TlsError::General(format!("malformed certificate: {e}")))?;
        let spki = parsed.public_key().raw;
        let pin = mesh_identity::compute_pin(spki);

        let mut store = self.pins.lock();
        match store.validate(&self.peer_id, &pin) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(e) => {
                warn!(peer = %self.peer_id, "certificate pin validation failed: {e}");
                Err(TlsError::General(format!("pin mismatch: {e}")))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

pub struct DirectQuicDialer {
    pins: Arc<Mutex<CertificatePinStore>>,
    stats: DialerStats,
}

impl DirectQuicDialer {
    pub fn new(pins: Arc<Mutex<CertificatePinStore>>) -> Self {
        Self {
            pins,
            stats: DialerStats::default(),
        }
    }

    fn client_config(&self, peer_id: &str) -> Result<quinn::ClientConfig, DialError> {
        let verifier = PinningVerifier {
            peer_id: peer_id.to_string(),
            pins: self.pins.clone(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let mut rustls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        rustls_config.alpn_protocols = vec![ALPN.to_vec()];

        let quic_config = QuicClientConfig::try_from(rustls_config)
            .map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;
        Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
    }
}

#[async_trait]
impl Dialer for DirectQuicDialer {
    fn can_handle(&self, endpoint: &str) -> bool {
        let Some((host, _)) = endpoint.rsplit_once(':') else {
            return false;
        };
        !mesh_identity::is_valid_onion_host(host) && !mesh_identity::is_valid_i2p_host(host)
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn dial(
        &self,
        endpoint: &str,
        peer_id: &str,
        _isolation_key: Option<&[u8]>,
    ) -> Result<DialerStream, DialError> {
        self.stats.record_attempt();
        let started = Instant::now();

        let result = self.dial_inner(endpoint, peer_id).await;
        match result {
            Ok(stream) => {
                self.stats.record_success(started);
                info!(endpoint, "direct quic dial succeeded");
                Ok(stream)
            }
            Err(e) => {
                self.stats.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    fn stats(&self) -> DialerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl DirectQuicDialer {
    async fn dial_inner(&self, endpoint: &str, peer_id: &str) -> Result<DialerStream, DialError> {
        let socket_addr: std::net::SocketAddr = endpoint
            .parse()
            .map_err(|_| DialError::InvalidEndpoint(endpoint.to_string()))?;
        let client_config = self.client_config(peer_id)?;

        let mut quinn_endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(DialError::Io)?;
        quinn_endpoint.set_default_client_config(client_config);

        let connecting = quinn_endpoint
            .connect(socket_addr, "mesh-peer")
            .map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| DialError::InvalidEndpoint(e.to_string()))?;
        Ok(Box::new(QuicDuplex { send, recv }))
    }
}

struct QuicDuplex {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl tokio::io::AsyncRead for QuicDuplex {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(std::pin::Pin::new(&mut self.recv), cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicDuplex {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(std::pin::Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(std::pin::Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(std::pin::Pin::new(&mut self.send), cx)
    }
}
