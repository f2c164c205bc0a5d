//! QUIC endpoints and sessions.
//!
//! A session is one bidirectional stream between a client and the relay.
//! The client opens it and speaks first (Identify), the relay accepts it.

use crate::error::TransportError;
use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig,
    TransportConfig, VarInt,
};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const ALPN: &[u8] = b"bindrop/1";

/// How long `connect` waits for the relay before giving up
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    pub connection: Connection,
    pub send: SendStream,
    pub recv: RecvStream,
}

impl Session {
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

fn install_crypto_provider() {
    // Fails harmlessly when a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Generate a self-signed certificate for the relay
pub fn generate_self_signed_cert()
-> Result<(Vec<CertificateDer<'static>>, PrivatePkcs8KeyDer<'static>), TransportError> {
    let certified_key = generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    Ok((vec![cert_der], key))
}

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    // 30 s, expressed in milliseconds
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(30_000))));
    transport_config.keep_alive_interval(Some(Duration::from_secs(2)));
    transport_config.stream_receive_window((16 * 1024 * 1024u32).into());
    transport_config.receive_window((32 * 1024 * 1024u32).into());
    transport_config.send_window(32 * 1024 * 1024);
    transport_config
}

/// Create the relay's QUIC endpoint
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint, TransportError> {
    install_crypto_provider();
    let (certs, key) = generate_self_signed_cert()?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport_config()));

    Endpoint::server(server_config, bind_addr).map_err(|source| TransportError::Bind {
        addr: bind_addr,
        source,
    })
}

/// Create a client endpoint. The relay certificate is self-signed, so it
/// is not verified; confidentiality of content comes from the end-to-end
/// key, not from TLS.
pub fn make_client_endpoint() -> Result<Endpoint, TransportError> {
    install_crypto_provider();
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport_config()));

    let bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
    let mut endpoint =
        Endpoint::client(bind_addr).map_err(|source| TransportError::Bind { addr: bind_addr, source })?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Connect to the relay and open the session stream
pub async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Session, TransportError> {
    let attempt = async {
        let connecting = endpoint
            .connect(addr, "localhost")
            .map_err(|e| TransportError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        let connection = connecting.await.map_err(|e| TransportError::Connect {
            addr,
            reason: e.to_string(),
        })?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok(Session {
            connection,
            send,
            recv,
        })
    };

    tokio::time::timeout(CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| TransportError::ConnectTimeout(addr))?
}

/// Wait for the client to open its session stream
pub async fn accept_session(connection: Connection) -> Result<Session, TransportError> {
    let (send, recv) = connection.accept_bi().await.map_err(|e| match e {
        quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed => {
            TransportError::Closed
        }
        other => TransportError::Stream(other.to_string()),
    })?;
    Ok(Session {
        connection,
        send,
        recv,
    })
}

/// Resolve `host:port`, preferring IPv4
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Stream(format!("cannot resolve {}: {}", host, e)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Stream(format!("no address for {}", host)))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
