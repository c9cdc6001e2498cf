use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("read {filename:?} failed: {err}")]
    FileReadFailed { filename: PathBuf, err: io::Error },
    #[error("no certificate found in {filename:?}")]
    NoCertificate { filename: PathBuf },
    #[error("no private key found in {filename:?}")]
    NoPrivateKey { filename: PathBuf },
    #[error("parse {filename:?} failed: {err}")]
    Parse { filename: PathBuf, err: io::Error },
    #[error("add certificate to root store failed: {0}")]
    AddCertToStore(rustls::Error),
    #[error("load native root certificates failed")]
    NativeCerts,
    #[error("\"cert-file\" requires \"key-file\"")]
    MissingKey,
    #[error("\"key-file\" requires \"cert-file\"")]
    MissingCertificate,
    #[error("server TLS requires \"cert-file\" and \"key-file\"")]
    MissingCertAndKey,
    #[error("build TLS config failed: {0}")]
    Build(rustls::Error),
}

/// TLS options for a gNMI channel, the coordination client or the API
/// server.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TlsConfig {
    /// CA certificate bundle, PEM. Without it the native roots are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    /// Client (or server) certificate, PEM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// Private key for `cert-file`, PEM (PKCS#8 or RSA).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Accept any server certificate. Outgoing connections only.
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let mut root_store = RootCertStore::empty();
        if let Some(ca_file) = &self.ca_file {
            for cert in load_certs(ca_file)? {
                root_store.add(cert).map_err(TlsError::AddCertToStore)?;
            }
        } else {
            let result = rustls_native_certs::load_native_certs();
            if result.certs.is_empty() && !result.errors.is_empty() {
                warn!(
                    message = "native root CA certificate loading errors",
                    errs = ?result.errors
                );
                return Err(TlsError::NativeCerts);
            }

            for cert in result.certs {
                root_store.add(cert).map_err(TlsError::AddCertToStore)?;
            }
        }

        let builder = ClientConfig::builder().with_root_certificates(root_store);
        let mut config = match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = load_certs(cert_file)?;
                let key = load_private_key(key_file)?;

                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(TlsError::Build)?
            }
            (Some(_), None) => return Err(TlsError::MissingKey),
            (None, Some(_)) => return Err(TlsError::MissingCertificate),
            (None, None) => builder.with_no_client_auth(),
        };

        if self.skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        Ok(config)
    }

    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Err(TlsError::MissingCertAndKey);
        };

        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Build)
    }
}

/// Accepts whatever the peer presents. Only reachable via `skip-verify`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn load_certs(filename: &PathBuf) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let content = std::fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        filename: filename.clone(),
        err,
    })?;

    let certs = rustls_pemfile::certs(&mut content.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Parse {
            filename: filename.clone(),
            err,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate {
            filename: filename.clone(),
        });
    }

    Ok(certs)
}

fn load_private_key(filename: &PathBuf) -> Result<PrivateKeyDer<'static>, TlsError> {
    let content = std::fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        filename: filename.clone(),
        err,
    })?;

    rustls_pemfile::private_key(&mut content.as_slice())
        .map_err(|err| TlsError::Parse {
            filename: filename.clone(),
            err,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            filename: filename.clone(),
        })
}
