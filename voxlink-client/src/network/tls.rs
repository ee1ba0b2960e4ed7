//! TLS connection establishment
//!
//! Opens the TCP control connection and performs the TLS handshake
//! (minimum TLS 1.2), optionally presenting a PEM client certificate.
//! Server certificate validation is toggleable: Mumble deployments
//! overwhelmingly run self-signed certificates, so the default installs
//! a permissive verifier and surfaces the certificate's SHA-256
//! fingerprint for the caller to pin.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig as RustlsConfig, DigitallySignedStruct, RootCertStore};

use crate::config::{ClientCertificate, ClientConfig};
use crate::error::ClientError;

/// Timeout for the TCP connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Certificate verifier that accepts anything (fingerprint pinning is
/// the caller's job when validation is off)
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

/// Webpki root store, built once
static ROOT_STORE: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(roots)
});

/// Load a PEM client certificate chain and private key
fn load_client_certificate(
    certificate: &ClientCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ClientError> {
    let cert_file = File::open(&certificate.cert_path)
        .map_err(|e| ClientError::Tls(format!("cannot open certificate file: {}", e)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ClientError::Tls(format!("bad certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ClientError::Tls("certificate file holds no certificates".to_string()));
    }

    let key_file = File::open(&certificate.key_path)
        .map_err(|e| ClientError::Tls(format!("cannot open key file: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ClientError::Tls(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| ClientError::Tls("key file holds no private key".to_string()))?;

    Ok((certs, key))
}

/// Build the rustls client configuration for a connection
fn build_tls_config(config: &ClientConfig) -> Result<RustlsConfig, ClientError> {
    let builder = RustlsConfig::builder();

    let tls = match (&config.certificate, config.validate_server_certificate) {
        (Some(certificate), true) => {
            let (certs, key) = load_client_certificate(certificate)?;
            builder
                .with_root_certificates(ROOT_STORE.clone())
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("client certificate rejected: {}", e)))?
        }
        (Some(certificate), false) => {
            let (certs, key) = load_client_certificate(certificate)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("client certificate rejected: {}", e)))?
        }
        (None, true) => builder
            .with_root_certificates(ROOT_STORE.clone())
            .with_no_client_auth(),
        (None, false) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    };

    Ok(tls)
}

/// Resolve the host and return the first address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| ClientError::Resolve(format!("{}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| ClientError::Resolve(format!("{} resolved to no addresses", host)))
}

/// Establish the TLS control connection
///
/// Returns the stream, the resolved peer address (also the UDP voice
/// target), and the server certificate's SHA-256 fingerprint.
pub async fn establish_connection(
    config: &ClientConfig,
) -> Result<(TlsStream<TcpStream>, SocketAddr, Option<String>), ClientError> {
    let addr = resolve(&config.host, config.port).await?;

    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Connect(format!("timed out connecting to {}", addr)))?
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    tcp.set_nodelay(true)
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let tls_config = build_tls_config(config)?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(config.host.clone())
        .unwrap_or_else(|_| ServerName::try_from("localhost").expect("static name is valid"));

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::Tls(format!("handshake failed: {}", e)))?;

    let fingerprint = certificate_fingerprint(&stream);

    Ok((stream, addr, fingerprint))
}

/// SHA-256 fingerprint of the server's leaf certificate
fn certificate_fingerprint(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_io, session) = stream.get_ref();
    let certs = session.peer_certificates()?;
    let leaf = certs.first()?;
    Some(format_fingerprint(leaf.as_ref()))
}

/// Format raw certificate bytes as a colon-separated SHA-256 fingerprint
fn format_fingerprint(cert_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_bytes);
    let digest = hasher.finalize();

    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).expect("hex is ASCII"))
        .collect::<Vec<_>>()
        .join(":")
}
