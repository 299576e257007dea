//! TLS listener setup
//!
//! Builds a `TlsAcceptor` from PEM files named in the server
//! configuration, with optional client-certificate authentication
//! against a CA bundle.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsSettings;

/// TLS setup failure; fatal at startup.
#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    Certificate(String),
    PrivateKey(String),
    Config(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {e}"),
            TlsError::Certificate(msg) => write!(f, "certificate error: {msg}"),
            TlsError::PrivateKey(msg) => write!(f, "private key error: {msg}"),
            TlsError::Config(msg) => write!(f, "TLS config error: {msg}"),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader).map_err(|e| TlsError::PrivateKey(format!("{path}: {e}")))
}

fn load_ca_store(path: &str) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| TlsError::Certificate(format!("CA cert from {path}: {e}")))?;
    }
    Ok(store)
}

/// Build the acceptor for the TLS and secure-WebSocket listeners.
pub fn build_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&settings.cert)?;
    let key = load_private_key(&settings.key)?;

    let server_config = match (&settings.ca_cert, settings.require_client_cert) {
        (Some(ca), require) => {
            let store = load_ca_store(ca)?;
            let builder = WebPkiClientVerifier::builder(Arc::new(store));
            let verifier = if require {
                builder.build()
            } else {
                builder.allow_unauthenticated().build()
            }
            .map_err(|e| TlsError::Config(format!("client verifier: {e}")))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        (None, true) => {
            return Err(TlsError::Config(
                "ca_cert is required when require_client_cert is set".into(),
            ))
        }
        (None, false) => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key),
    }
    .map_err(|e| TlsError::Config(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
