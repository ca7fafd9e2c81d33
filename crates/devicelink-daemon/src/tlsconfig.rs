//! rustls configuration for the role-inversion handshake.
//!
//! Both sides of the protocol authenticate with self-signed certificates;
//! there is no CA. The TLS layer therefore accepts any peer certificate and
//! the pairing layer decides trust by comparing the presented certificate
//! against the trust store. That is what the `AcceptAnyServerCert` /
//! `AcceptAnyClientCert` verifiers below implement: the channel is always
//! encrypted and the peer always proves possession of its key, but
//! certificate *trust* is established out-of-band through pairing.
//!
//! Certificate and private key are supplied at startup as PEM files;
//! generating them is outside the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Errors raised while loading certificate material or building configs.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The certificate or key file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The PEM file contained no usable certificate.
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    /// The PEM file contained no usable private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// rustls rejected the certificate/key pair.
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// This device's certificate identity plus ready-made rustls configs.
pub struct TlsIdentity {
    /// Our own certificate, PEM text, as sent during pairing verification.
    pub certificate_pem: String,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsIdentity {
    /// Loads the certificate chain and private key from PEM files and
    /// builds the server- and client-role configs.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] when a file is missing, contains no usable PEM
    /// block, or rustls rejects the pair.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_text = std::fs::read_to_string(cert_path).map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_text.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|source| TlsError::Io {
                    path: cert_path.to_path_buf(),
                    source,
                })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
        }

        let key_bytes = std::fs::read(key_path).map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
            .map_err(|source| TlsError::Io {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(certs.clone(), key.clone_key())?;

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(certs.clone(), key)?;

        Ok(Self {
            certificate_pem: der_to_pem(certs[0].as_ref()),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Acceptor for connections where we take the TLS *server* role
    /// (outbound dials, after the plaintext identity write).
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Connector for connections where we take the TLS *client* role
    /// (inbound accepts, after reading the peer's plaintext identity).
    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

/// Extracts the peer's leaf certificate from an established stream as PEM.
pub fn peer_certificate_pem(stream: &TlsStream<TcpStream>) -> Option<String> {
    let certs = match stream {
        TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
        TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
    }?;
    certs.first().map(|der| der_to_pem(der.as_ref()))
}

/// Encodes DER certificate bytes as a PEM `CERTIFICATE` block.
pub fn der_to_pem(der: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        // chunks of a valid base64 string are valid UTF-8
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

// ── Permissive verifiers ──────────────────────────────────────────────────────

fn all_verify_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::ECDSA_NISTP521_SHA512,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
    ]
}

/// Accepts any server certificate; the pairing layer owns trust.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_verify_schemes()
    }
}

/// Requires a client certificate but accepts any; the pairing layer owns trust.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, tokio_rustls::rustls::Error> {
        Ok(ClientCertVerified::assertion())
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        all_verify_schemes()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_der_to_pem_wraps_at_64_columns() {
        let pem = der_to_pem(&[0xAB; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }

    #[test]
    fn test_der_to_pem_is_deterministic() {
        assert_eq!(der_to_pem(&[1, 2, 3]), der_to_pem(&[1, 2, 3]));
        assert_ne!(der_to_pem(&[1, 2, 3]), der_to_pem(&[3, 2, 1]));
    }

    #[test]
    fn test_load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        let result = TlsIdentity::load(&missing, &missing);
        assert!(matches!(result, Err(TlsError::Io { .. })));
    }

    #[test]
    fn test_load_reports_pem_without_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a pem file\n").unwrap();
        std::fs::write(&key, "not a pem file\n").unwrap();
        let result = TlsIdentity::load(&cert, &key);
        assert!(matches!(result, Err(TlsError::NoCertificate(_))));
    }
}
