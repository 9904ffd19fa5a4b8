//! TLS client material loading for target connections.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, fs};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {filename:?}: {err}")]
    FileRead {
        filename: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to parse PEM in {filename:?}: {err}")]
    PemParse {
        filename: PathBuf,
        #[source]
        err: pem::PemError,
    },

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("tls-cert set without tls-key")]
    MissingKey,

    #[error("tls-key set without tls-cert")]
    MissingCertificate,

    #[error("native root CA certificates could not be loaded")]
    NativeCerts,

    #[error("failed to add certificate to the root store: {0}")]
    AddCertToStore(rustls::Error),

    #[error("invalid TLS version {0:?}, must be 1.2 or 1.3")]
    InvalidVersion(String),

    #[error("tls-min-version is higher than tls-max-version")]
    EmptyVersionRange,

    #[error("failed to build the certificate verifier: {0}")]
    VerifierBuild(rustls::client::VerifierBuilderError),

    #[error("failed to build the client config: {0}")]
    ClientBuild(rustls::Error),
}

/// Configures the TLS material used for outgoing target connections.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TlsConfig {
    /// Path to a CA certificate file in PEM format. The system roots are
    /// used when unset.
    pub ca: Option<PathBuf>,

    /// Path to a client certificate file in PEM format. Requires `key`.
    pub cert: Option<PathBuf>,

    /// Path to the client private key in PEM format. Requires `cert`.
    pub key: Option<PathBuf>,

    /// Lowest TLS version offered, `1.2` or `1.3`.
    pub min_version: Option<String>,

    /// Highest TLS version offered, `1.2` or `1.3`.
    pub max_version: Option<String>,

    /// Disables certificate and hostname verification.
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let certs = match &self.ca {
            Some(ca) => load_certs(ca)?,
            None => {
                let result = rustls_native_certs::load_native_certs();
                if result.certs.is_empty() && !result.errors.is_empty() {
                    warn!(
                        message = "native root CA certificate loading errors",
                        errs = ?result.errors
                    );
                    return Err(TlsError::NativeCerts);
                }
                result.certs
            }
        };

        let mut root_store = RootCertStore::empty();
        for cert in certs {
            root_store.add(cert).map_err(TlsError::AddCertToStore)?;
        }
        let root_store = Arc::new(root_store);

        let versions = protocol_versions(self.min_version.as_deref(), self.max_version.as_deref())?;
        let builder = ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(Arc::clone(&root_store));

        let mut config = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_private_key(key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(TlsError::ClientBuild)?
            }
            (Some(_), None) => return Err(TlsError::MissingKey),
            (None, Some(_)) => return Err(TlsError::MissingCertificate),
            (None, None) => builder.with_no_client_auth(),
        };

        if self.skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify {
                    inner: WebPkiServerVerifier::builder(root_store)
                        .build()
                        .map_err(TlsError::VerifierBuild)?,
                }));
        }

        Ok(config)
    }
}

fn protocol_versions(
    min: Option<&str>,
    max: Option<&str>,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
    fn rank(version: &str) -> Result<u16, TlsError> {
        match version {
            "1.2" => Ok(2),
            "1.3" => Ok(3),
            other => Err(TlsError::InvalidVersion(other.to_string())),
        }
    }

    let min = min.map(rank).transpose()?.unwrap_or(2);
    let max = max.map(rank).transpose()?.unwrap_or(3);

    let versions: Vec<_> = [
        (2, &rustls::version::TLS12),
        (3, &rustls::version::TLS13),
    ]
    .into_iter()
    .filter(|(rank, _)| (min..=max).contains(rank))
    .map(|(_, version)| version)
    .collect();

    if versions.is_empty() {
        return Err(TlsError::EmptyVersionRange);
    }

    Ok(versions)
}

fn load_certs(filename: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileRead {
        filename: filename.to_path_buf(),
        err,
    })?;

    let certs = pem::parse_many(content)
        .map_err(|err| TlsError::PemParse {
            filename: filename.to_path_buf(),
            err,
        })?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();

    Ok(certs)
}

fn load_private_key(filename: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileRead {
        filename: filename.to_path_buf(),
        err,
    })?;

    let blocks = pem::parse_many(content).map_err(|err| TlsError::PemParse {
        filename: filename.to_path_buf(),
        err,
    })?;

    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(block.into_contents().into()),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(block.into_contents().into()),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(block.into_contents().into()),
            _ => continue,
        };
        return Ok(key);
    }

    Err(TlsError::NoPrivateKey(filename.to_path_buf()))
}

/// Accepts any server certificate, delegating signature checks to the
/// webpki verifier so the handshake itself stays well formed.
struct NoVerify {
    inner: Arc<WebPkiServerVerifier>,
}

impl fmt::Debug for NoVerify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoVerify").finish_non_exhaustive()
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ranges() {
        assert_eq!(protocol_versions(None, None).unwrap().len(), 2);
        assert_eq!(protocol_versions(Some("1.3"), None).unwrap().len(), 1);
        assert_eq!(protocol_versions(None, Some("1.2")).unwrap().len(), 1);
        assert!(matches!(
            protocol_versions(Some("1.3"), Some("1.2")),
            Err(TlsError::EmptyVersionRange)
        ));
        assert!(matches!(
            protocol_versions(Some("1.1"), None),
            Err(TlsError::InvalidVersion(_))
        ));
    }
}
