//! X.509 issuance
//!
//! One primitive, [`create_tls_certificate`], builds every certificate the
//! host needs: the self-signed cluster CA, CA-signed client and server
//! leaves, and the self-signed HTTPS fallback.

use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::info;

use super::keys::{generate_rsa_key, RSA_KEY_BITS};
use super::{CertificateError, CertificatePair};

/// Validity of every issued certificate
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Parameters for [`create_tls_certificate`]
#[derive(Debug, Clone)]
pub struct TlsCertificateParams {
    pub common_name: String,
    /// Extra SAN entries; the common name is always the first SAN
    pub alt_names: Vec<String>,
    /// Emit `basicConstraints.cA = true`
    pub is_ca: bool,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    /// PEM private key to certify; a fresh RSA key is generated when absent
    pub private_key: Option<String>,
    /// CA certificate and key to sign with; self-signed when absent
    pub issuer: Option<CertificatePair>,
    /// Modulus size used when a key has to be generated
    pub key_bits: usize,
}

impl TlsCertificateParams {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            alt_names: Vec::new(),
            is_ca: false,
            key_usages: Vec::new(),
            extended_key_usages: Vec::new(),
            private_key: None,
            issuer: None,
            key_bits: RSA_KEY_BITS,
        }
    }

    /// Self-signed CA able to sign leaves
    pub fn certificate_authority(common_name: impl Into<String>) -> Self {
        Self {
            is_ca: true,
            key_usages: vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            ..Self::new(common_name)
        }
    }

    /// Client-auth leaf signed by `ca`
    pub fn client(common_name: impl Into<String>, ca: &CertificatePair) -> Self {
        Self {
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
            issuer: Some(ca.clone()),
            ..Self::new(common_name)
        }
    }

    /// Server-auth leaf for every hostname, signed by `ca`
    pub fn server(hostnames: &[String], ca: &CertificatePair) -> Self {
        let common_name = hostnames.first().cloned().unwrap_or_else(|| "localhost".to_string());
        Self {
            alt_names: hostnames.iter().skip(1).cloned().collect(),
            key_usages: vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ServerAuth],
            issuer: Some(ca.clone()),
            ..Self::new(common_name)
        }
    }

    /// SAN entries: common name first, duplicates removed
    pub fn subject_alt_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.alt_names.len() + 1);
        for name in std::iter::once(&self.common_name).chain(self.alt_names.iter()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Build and sign a one-year certificate
pub async fn create_tls_certificate(
    params: TlsCertificateParams,
) -> Result<CertificatePair, CertificateError> {
    let key_pem = match params.private_key.clone() {
        Some(key) => key,
        None => generate_rsa_key(params.key_bits).await?.private_pem,
    };
    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| CertificateError::Parse(format!("failed to load private key: {}", e)))?;

    let mut cert_params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(params.common_name.clone()),
    );
    cert_params.distinguished_name = dn;

    cert_params.subject_alt_names = params
        .subject_alt_names()
        .into_iter()
        .map(|name| {
            if let Ok(ip) = name.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        CertificateError::Generation(format!("invalid DNS name '{}': {}", name, e))
                    })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    cert_params.is_ca = if params.is_ca {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    cert_params.key_usages = params.key_usages.clone();
    cert_params.extended_key_usages = params.extended_key_usages.clone();

    let now = time::OffsetDateTime::now_utc();
    cert_params.not_before = now;
    cert_params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    cert_params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let cert = match &params.issuer {
        Some(ca) => {
            let ca_key = KeyPair::from_pem(&ca.key)
                .map_err(|e| CertificateError::Parse(format!("failed to load CA key: {}", e)))?;
            let issuer = Issuer::from_ca_cert_pem(&ca.crt, &ca_key)
                .map_err(|e| CertificateError::Parse(format!("failed to load CA certificate: {}", e)))?;
            cert_params.signed_by(&key_pair, &issuer)?
        }
        None => cert_params.self_signed(&key_pair)?,
    };

    info!(
        common_name = %params.common_name,
        ca = params.is_ca,
        signed_by_ca = params.issuer.is_some(),
        "Issued certificate"
    );

    Ok(CertificatePair {
        crt: cert.pem(),
        key: key_pem,
    })
}
