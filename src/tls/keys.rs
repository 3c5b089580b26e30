//! Key generation primitives
//!
//! RSA generation is CPU bound; async callers go through [`generate_rsa_key`]
//! which runs it on the blocking pool.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::CertificateError;

/// Default RSA modulus size for every generated key
pub const RSA_KEY_BITS: usize = 4096;

/// PEM-encoded RSA key pair (PKCS#8 private, SPKI public)
#[derive(Debug, Clone)]
pub struct RsaKeyPair {
    pub private_pem: String,
    pub public_pem: String,
}

/// SSH key pair with its OpenSSH public line and fingerprint
#[derive(Debug, Clone)]
pub struct SshKeyPair {
    pub private_pem: String,
    /// `ssh-rsa AAAA...`
    pub public_openssh: String,
    /// `SHA256:...`, as printed by `ssh-keygen -l`
    pub fingerprint: String,
}

/// Generate an RSA key pair synchronously
pub fn generate_rsa_key_pair(bits: usize) -> Result<RsaKeyPair, CertificateError> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))?
        .to_string();
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))?;

    debug!(bits, "Generated RSA key pair");
    Ok(RsaKeyPair {
        private_pem,
        public_pem,
    })
}

/// Generate an RSA key pair on the blocking pool
pub async fn generate_rsa_key(bits: usize) -> Result<RsaKeyPair, CertificateError> {
    tokio::task::spawn_blocking(move || generate_rsa_key_pair(bits))
        .await
        .map_err(|e| CertificateError::KeyGeneration(format!("key generation task failed: {}", e)))?
}

/// Parse an RSA private key in PKCS#8 or PKCS#1 PEM form
pub fn parse_rsa_private_key(pem: &str) -> Result<RsaPrivateKey, CertificateError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CertificateError::Parse(format!("failed to parse RSA private key: {}", e)))
}

/// Generate an RSA key pair usable for SSH
pub async fn create_ssh_key_pair() -> Result<SshKeyPair, CertificateError> {
    let pair = generate_rsa_key(RSA_KEY_BITS).await?;
    ssh_key_pair_from_pem(&pair.private_pem)
}

/// Derive the OpenSSH public line and fingerprint for a PEM private key
pub fn ssh_key_pair_from_pem(private_pem: &str) -> Result<SshKeyPair, CertificateError> {
    let private = parse_rsa_private_key(private_pem)?;
    let public = RsaPublicKey::from(&private);

    // RFC 4253 section 6.6: string "ssh-rsa", mpint e, mpint n
    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_ssh_mpint(&mut blob, &public.e().to_bytes_be());
    write_ssh_mpint(&mut blob, &public.n().to_bytes_be());

    let fingerprint = format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&blob)));
    Ok(SshKeyPair {
        private_pem: private_pem.to_string(),
        public_openssh: format!("ssh-rsa {}", STANDARD.encode(&blob)),
        fingerprint,
    })
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn write_ssh_mpint(out: &mut Vec<u8>, magnitude: &[u8]) {
    let trimmed = match magnitude.iter().position(|b| *b != 0) {
        Some(start) => &magnitude[start..],
        None => &[],
    };
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        out.extend_from_slice(&((trimmed.len() + 1) as u32).to_be_bytes());
        out.push(0);
        out.extend_from_slice(trimmed);
    } else {
        write_ssh_string(out, trimmed);
    }
}
