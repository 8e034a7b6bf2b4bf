//! QUIC endpoint and TLS setup
//!
//! Server certificates come from PEM files or are generated self-signed.
//! Clients verify against the webpki roots plus an optional CA file, or skip
//! verification entirely in insecure mode.

use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ClientSection, TlsConfig};

/// ALPN token spoken by both ends
pub const ALPN: &[u8] = b"quictun";

/// QUIC idle timeout; the liveness probe runs well inside it
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on concurrent channels per session
const MAX_STREAMS: u32 = 1024;

/// Build QUIC server configuration
pub async fn build_server_config(tls: &TlsConfig) -> Result<ServerConfig> {
    let (certs, key) = load_or_generate_certs(tls).await?;

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")?;
    rustls_config.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(rustls_config)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Ok(server_config)
}

/// Build QUIC client configuration
pub fn build_client_config(client: &ClientSection) -> Result<ClientConfig> {
    let mut tls_config = if client.insecure {
        warn!("TLS certificate verification disabled (insecure mode)");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = &client.ca_path {
            for cert in read_certs(ca_path)? {
                root_store
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {}", ca_path))?;
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    tls_config.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    Ok(client_config)
}

/// Create a server endpoint on `bind_addr`
pub fn server_endpoint(server_config: ServerConfig, bind_addr: SocketAddr) -> Result<Endpoint> {
    let socket = crate::util::create_udp_socket(bind_addr)?;
    let runtime =
        quinn::default_runtime().ok_or_else(|| anyhow::anyhow!("No async runtime found"))?;

    Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server_config),
        socket,
        runtime,
    )
    .context("Failed to create QUIC endpoint")
}

/// Create a client endpoint bound to an ephemeral port
pub fn client_endpoint(client_config: ClientConfig, server_addr: SocketAddr) -> Result<Endpoint> {
    let bind: SocketAddr = if server_addr.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0, 0, 0, 0], 0))
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

fn transport_config() -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_STREAMS));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("Invalid idle timeout")?,
    ));
    transport.keep_alive_interval(Some(Duration::from_secs(15)));
    transport.send_window(8 * 1024 * 1024);
    transport.receive_window(VarInt::from_u32(8 * 1024 * 1024));
    transport.stream_receive_window(VarInt::from_u32(2 * 1024 * 1024));
    Ok(transport)
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("Failed to read {}", path))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")
}

/// Load certificates from files or generate self-signed
async fn load_or_generate_certs(
    tls: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = std::path::Path::new(&tls.cert_path);
    let key_path = std::path::Path::new(&tls.key_path);

    if cert_path.exists() && key_path.exists() {
        info!(cert = %tls.cert_path, key = %tls.key_path, "Loading TLS certificates");

        let cert_pem = tokio::fs::read(&tls.cert_path)
            .await
            .context("Failed to read certificate file")?;
        let key_pem = tokio::fs::read(&tls.key_path)
            .await
            .context("Failed to read key file")?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificates")?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found in file"))?;

        Ok((certs, key))
    } else if tls.auto_generate {
        warn!("Generating self-signed certificate (not for production use)");

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("Failed to generate self-signed certificate")?;

        let cert_der = CertificateDer::from(cert.cert);
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        Ok((vec![cert_der], key_der))
    } else {
        anyhow::bail!(
            "TLS certificate not found at {} and auto_generate is disabled",
            tls.cert_path
        )
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct InsecureServerVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
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
