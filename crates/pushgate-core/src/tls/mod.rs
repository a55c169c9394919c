//! Client TLS identity loading and configuration.
//!
//! Both Apple gateways require mutual TLS: the provider certificate issued
//! through the developer portal authenticates every connection. The
//! certificate and key are loaded once from PEM files and the resulting
//! rustls configuration is shared read-only by all workers and the
//! feedback client.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

/// Errors from identity loading or TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The certificate file contained no certificates.
    #[error("no certificates found in {path}")]
    NoCertificates {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// The key file contained no private key.
    #[error("no private key found in {path}")]
    NoPrivateKey {
        /// Path of the offending file.
        path: PathBuf,
    },

    /// rustls rejected the certificate/key pair.
    #[error("invalid client certificate or key: {0}")]
    InvalidIdentity(#[from] rustls::Error),
}

/// A loaded client certificate chain and private key.
#[derive(Debug)]
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Loads the certificate chain and private key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] when either file cannot be read or parsed, or
    /// contains no usable material.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = read_pem(cert_path, |reader| {
            rustls_pemfile::certs(reader).collect::<Result<Vec<_>, _>>()
        })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates {
                path: cert_path.to_path_buf(),
            });
        }

        let key = read_pem(key_path, |reader| rustls_pemfile::private_key(reader))?
            .ok_or_else(|| TlsError::NoPrivateKey {
                path: key_path.to_path_buf(),
            })?;

        Ok(Self { certs, key })
    }
}

fn read_pem<T>(
    path: &Path,
    parse: impl FnOnce(&mut BufReader<File>) -> Result<T, io::Error>,
) -> Result<T, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    parse(&mut reader).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds the shared rustls client configuration: webpki trust anchors for
/// the gateway certificate, the loaded identity for client authentication.
///
/// # Errors
///
/// Returns a [`TlsError`] when rustls rejects the identity.
pub fn client_config(identity: TlsIdentity) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
    .with_root_certificates(roots)
    .with_client_auth_cert(identity.certs, identity.key)?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_missing_file() {
        let missing = Path::new("/nonexistent/apns-cert.pem");
        let err = TlsIdentity::load(missing, missing).unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn test_load_rejects_file_without_certificates() {
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert_file, "not a certificate").unwrap();
        let key_file = tempfile::NamedTempFile::new().unwrap();

        let err = TlsIdentity::load(cert_file.path(), key_file.path()).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates { .. }));
    }
}
