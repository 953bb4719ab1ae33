//! X509 certificate and TLS configuration helpers
// (c) 2024 Ross Younger

use std::{path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use rcgen::CertifiedKey;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    DigitallySignedStruct, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::{trace, warn};

use crate::protocol::ALPN;

/// In-memory representation of TLS credentials
#[allow(missing_debug_implementations)]
pub struct Credentials {
    /// A keypair with self-signed X509 certificate
    pub keypair: CertifiedKey,
    /// The hostname to which this applies (for convenience)
    pub hostname: String,
}

impl Credentials {
    /// Generates a self-certified keypair, valid for `localhost` and the local hostname
    pub fn generate() -> Result<Self> {
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or("unknown.host.invalid".to_string());
        trace!("Creating certificate with hostname {hostname}");
        let names = vec!["localhost".to_string(), hostname.clone()];
        Ok(Self {
            keypair: rcgen::generate_simple_self_signed(names)?,
            hostname,
        })
    }

    /// Extracts the certificate in DER format
    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        self.keypair.cert.der()
    }

    /// Extracts the private key in DER format
    #[must_use]
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.keypair.key_pair.serialize_der().into())
    }

    /// Writes the certificate (DER) to a file, so a client can pin it
    pub fn write_certificate(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.certificate().as_ref())
            .with_context(|| format!("writing certificate to {}", path.display()))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Creates the TLS configuration for the server side of a connection
pub(crate) fn server_tls_config(credentials: &Credentials) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(
            vec![credentials.certificate().clone()],
            credentials.private_key_der(),
        )?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Creates the TLS configuration for the client side of a connection.
///
/// If `server_cert` is given, the server must present exactly that certificate (DER format).
/// If not, any server certificate is accepted.
pub(crate) fn client_tls_config(server_cert: Option<&Path>) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;
    let mut config = if let Some(path) = server_cert {
        let der = std::fs::read(path)
            .with_context(|| format!("reading server certificate {}", path.display()))?;
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(CertificateDer::from(der))
            .context("parsing server certificate")?;
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        warn!("No server certificate given; the server's identity will NOT be checked");
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// A certificate verifier that accepts any server certificate.
///
/// Handshake signatures are still checked, so the peer must hold the key for the
/// certificate it presents; but nothing ties that certificate to a trusted identity.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
