use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{0} is required when TLS is enabled")]
    MissingPath(&'static str),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("Invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Failed to build client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Build a TLS acceptor from PEM files. A CA bundle enables client
/// certificate verification; clients without a certificate are still
/// accepted so that token credentials keep working.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or(TlsError::MissingPath("TLS_CERT_PATH"))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or(TlsError::MissingPath("TLS_KEY_PATH"))?;

    let certs = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let mut tls_config = match &config.ca_path {
        Some(ca_path) => {
            let mut root_store = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                root_store.add(cert)?;
            }
            let client_verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider)
                    .allow_unauthenticated()
                    .build()?;
            builder
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, private_key)?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, private_key)?,
    };
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
