//! Certificate authority for the host
//!
//! Validates and issues X.509 material for two audiences:
//! - the public HTTPS front door (ACME-issued, or self-signed when insecure)
//! - the cluster mutual-TLS hierarchy used between the Docker engine and the
//!   central authority (one CA, one client leaf, one server leaf)
//!
//! Certificates are immutable values: renewal always produces a new
//! [`CertificatePair`] that the caller hands to the settings store.

pub mod acme;
pub mod hierarchy;
pub mod issue;
pub mod keys;
pub mod validate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use acme::{create_https_certificate, AcmeRequest, ChallengeStore, HttpsCertificate};
pub use hierarchy::{renew_hierarchy, CertificateHierarchy, HierarchyRenewal, ServerFiles};
pub use issue::{create_tls_certificate, TlsCertificateParams, CERT_VALIDITY_DAYS};
pub use keys::{create_ssh_key_pair, generate_rsa_key_pair, RsaKeyPair, SshKeyPair, RSA_KEY_BITS};
pub use validate::{is_valid, is_valid_at, CertificateCheck, EXPIRY_MARGIN_SECS};

/// PEM certificate with its PEM private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePair {
    pub crt: String,
    pub key: String,
}

/// Errors from certificate generation and ACME issuance
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("ACME order for {identifier} ended in state {status}")]
    AcmeOrder { identifier: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CertificateError {
    fn from(e: rcgen::Error) -> Self {
        CertificateError::Generation(e.to_string())
    }
}

impl From<instant_acme::Error> for CertificateError {
    fn from(e: instant_acme::Error) -> Self {
        CertificateError::Acme(e.to_string())
    }
}
