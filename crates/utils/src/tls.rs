use std::{error::Error, fmt::Display};

use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::ServerSessionMemoryCache,
    ServerConfig,
};

/// Errors that can occur while loading the TLS server configuration.
#[derive(Debug)]
pub enum TlsError {
    /// The certificate or key file could not be read or decoded.
    Pem(rustls::pki_types::pem::Error),
    /// The certificate chain and key were rejected by rustls.
    Rustls(rustls::Error),
}

impl Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Pem(e) => write!(f, "TLS PEM error: {e}"),
            TlsError::Rustls(e) => write!(f, "TLS configuration error: {e}"),
        }
    }
}

impl Error for TlsError {}

impl From<rustls::pki_types::pem::Error> for TlsError {
    fn from(e: rustls::pki_types::pem::Error) -> Self {
        TlsError::Pem(e)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Rustls(e)
    }
}

/// Loads the TLS configuration used for `STARTTLS` on inbound sessions.
///
/// `cert_path` holds the PEM certificate chain and `key_path` the PEM
/// private key.
pub fn load_tls_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, TlsError> {
    let cert_chain = CertificateDer::pem_file_iter(cert_path)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    // Allow multiple sessions per client, making it possible to
    // re-use the same TLS connection for multiple SMTP sessions
    config.session_storage = ServerSessionMemoryCache::new(256);
    Ok(config)
}
