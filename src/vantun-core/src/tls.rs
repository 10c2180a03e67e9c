//! TLS and QUIC endpoint configuration.
//!
//! Servers load PEM certificates or fall back to a generated self-signed
//! pair; clients verify against webpki roots, a custom CA, or (explicitly)
//! nothing. All endpoints speak TLS 1.3 with ALPN `vantun`.

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig as QuinnClientConfig, ServerConfig, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, private_key};

use crate::error::{Error, Result};
use crate::ALPN;

/// Idle timeout applied to both endpoint roles.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a client validates the server certificate.
#[derive(Debug, Clone, Default)]
pub enum ClientVerification {
    /// Public webpki roots
    #[default]
    WebpkiRoots,
    /// A caller-supplied CA bundle (PEM)
    CustomCa(std::path::PathBuf),
    /// Skip verification entirely. Only for tests and local development.
    Insecure,
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigInvalid(format!("parsing certificates from {path:?}: {e}")))
}

/// Load a private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| Error::ConfigInvalid(format!("parsing private key from {path:?}: {e}")))?
        .ok_or_else(|| Error::ConfigInvalid(format!("no private key found in {path:?}")))
}

/// Generate a self-signed certificate for the given DNS names.
pub fn generate_self_signed(
    names: &[&str],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(
        names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
    )
    .map_err(|e| Error::ConfigInvalid(format!("generating self-signed cert: {e}")))?;
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    Ok((vec![certified.cert.der().clone()], key))
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .map_err(|_| Error::ConfigInvalid("idle timeout out of range".into()))?,
    ));
    Ok(Arc::new(transport))
}

/// Build the QUIC server configuration.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::ConfigInvalid(format!("tls versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::ConfigInvalid(format!("server certificate: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls))
        .map_err(|e| Error::ConfigInvalid(format!("quic server crypto: {e}")))?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

/// Build the QUIC client configuration for a verification policy.
pub fn build_client_config(verification: &ClientVerification) -> Result<QuinnClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::ConfigInvalid(format!("tls versions: {e}")))?;

    let mut tls = match verification {
        ClientVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth(),
        ClientVerification::CustomCa(path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::ConfigInvalid(format!("adding CA cert: {e}")))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        ClientVerification::WebpkiRoots => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| Error::ConfigInvalid(format!("quic client crypto: {e}")))?;
    let mut config = QuinnClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

/// Bind a client endpoint on an ephemeral port with `client` as its default.
pub fn build_client_endpoint(client: QuinnClientConfig) -> Result<quinn::Endpoint> {
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let mut endpoint = quinn::Endpoint::client(bind)?;
    endpoint.set_default_client_config(client);
    Ok(endpoint)
}

/// Bind a server endpoint on `addr`.
pub fn build_server_endpoint(addr: SocketAddr, config: ServerConfig) -> Result<quinn::Endpoint> {
    Ok(quinn::Endpoint::server(config, addr)?)
}

/// Certificate verifier that accepts anything.
///
/// Makes the trust decision explicit at the call site; never the default.
#[derive(Debug)]
pub struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_round_trips_into_configs() {
        let (certs, key) = generate_self_signed(&["localhost"]).unwrap();
        assert_eq!(certs.len(), 1);
        build_server_config(certs, key).unwrap();
        build_client_config(&ClientVerification::Insecure).unwrap();
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        assert!(load_certs(Path::new("/nonexistent/cert.pem")).is_err());
        assert!(load_key(Path::new("/nonexistent/key.pem")).is_err());
    }
}
