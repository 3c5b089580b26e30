//! Crate-wide error and result types

use thiserror::Error;

use crate::tls::CertificateError;

/// Errors surfaced by the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("OAuth2 error: {0}")]
    OAuth2(#[from] crate::auth::OAuth2Error),

    #[error("Authority request failed: {0}")]
    Authority(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection cannot be answered with a response and is dropped
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

impl From<rustls::Error> for GatewayError {
    fn from(e: rustls::Error) -> Self {
        GatewayError::Tls(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
