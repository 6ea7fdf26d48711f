//! TLS material for `tls+tcp` pools.
//!
//! When a pool requests TLS without supplying credentials, an ephemeral
//! self-signed certificate pair is generated. The pair is single-use:
//! reset + configure generates a fresh one. Daemons receive the
//! certificate as their trust anchor at launch; the dispatcher receives
//! the full pair in the configuration handshake.

use std::sync::Arc;

use rcgen::{CertificateParams, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("invalid pem: {0}")]
    Pem(std::io::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error("no certificate found in pem input")]
    MissingCertificate,
    #[error("no private key found in pem input")]
    MissingPrivateKey,
    #[error("encrypted private keys are not supported; supply an unencrypted key")]
    EncryptedKeyUnsupported,
    #[error("certificate rejected as trust anchor: {0}")]
    BadTrustAnchor(rustls::Error),
}

/// A PEM certificate/key pair. The certificate doubles as the trust
/// anchor handed to dialing daemons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate an ephemeral self-signed pair whose subject alternative
/// names cover `host` plus the loopback spellings local daemons dial.
pub fn generate_ephemeral(host: &str) -> Result<TlsMaterial, TlsError> {
    let mut names = vec![
        host.to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    names.dedup();

    let mut params = CertificateParams::new(names)?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("taskmill pool {host}"));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(TlsMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Build the listener-side config from a pair. `password` is forwarded
/// from the configuration surface; encrypted keys are rejected rather
/// than silently ignored.
pub fn server_config(
    material: &TlsMaterial,
    password: Option<&str>,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    if password.is_some() || material.key_pem.contains("ENCRYPTED") {
        return Err(TlsError::EncryptedKeyUnsupported);
    }

    let certs = parse_certs(&material.cert_pem)?;
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())
        .map_err(TlsError::Pem)?
        .ok_or(TlsError::MissingPrivateKey)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build the dialer-side config trusting `anchor_pem` (the pool
/// certificate handed to daemons at launch).
pub fn client_config(anchor_pem: &str) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let certs = parse_certs(anchor_pem)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(TlsError::BadTrustAnchor)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::MissingCertificate);
    }
    Ok(certs)
}
