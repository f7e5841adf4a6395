//! TLS acceptor for the gateway
//!
//! Certificate and key come from settings as base64-encoded PEM. When TLS is
//! enabled without material a self-signed certificate is generated instead.

use crate::config::TlsSettings;
use base64::Engine as _;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Build an acceptor from settings
pub fn build_acceptor(tls: &TlsSettings) -> anyhow::Result<TlsAcceptor> {
    let material = match (non_empty(&tls.cert), non_empty(&tls.key)) {
        (Some(cert), Some(key)) => Some((decode_base64("cert", cert)?, decode_base64("key", key)?)),
        _ => None,
    };

    let (certs, key) = match material {
        Some((cert_pem, key_pem)) => {
            let certs = load_certs(&cert_pem)?;
            let key = load_key(&key_pem)?;
            info!(certificates = certs.len(), "TLS enabled with provided certificate");
            (certs, key)
        }
        None => {
            warn!("TLS enabled without cert/key, using a self-signed certificate (not for production)");
            generate_self_signed_cert()?
        }
    };

    acceptor_from(certs, key)
}

pub fn acceptor_from(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn decode_base64(field: &str, value: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| anyhow::anyhow!("TLS {} is not valid base64: {}", field, e))
}

pub fn load_certs(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in TLS cert");
    }

    Ok(certs)
}

pub fn load_key(pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = &pem[..];

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse TLS key: {}", e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in TLS key")
}

pub fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
