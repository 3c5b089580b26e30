//! rustls server configuration from persisted PEM material

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::HttpsMaterial;
use crate::types::{GatewayError, Result};

/// Acceptor presenting `https.crt` followed by the `https.ca` chain
pub fn tls_acceptor(https: &HttpsMaterial) -> Result<TlsAcceptor> {
    let (Some(crt), Some(key)) = (&https.crt, &https.key) else {
        return Err(GatewayError::Tls(
            "HTTPS certificate or key missing".to_string(),
        ));
    };

    let mut chain = parse_certificates(crt)?;
    for ca in &https.ca {
        chain.extend(parse_certificates(ca)?);
    }
    if chain.is_empty() {
        return Err(GatewayError::Tls("no certificate in https.crt".to_string()));
    }
    let key = parse_private_key(key)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("failed to parse certificate: {}", e)))
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| GatewayError::Tls("no private key in https.key".to_string()))
}
