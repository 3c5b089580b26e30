//! Certificate validation
//!
//! [`is_valid`] never fails: every problem (unparsable PEM, expiry, wrong
//! issuer, key mismatch, missing hostname) is reported as `false` with the
//! reason at debug level.

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPublicKey;
use tracing::debug;
use x509_parser::prelude::*;

use super::keys::parse_rsa_private_key;

/// A certificate must stay valid for at least this long to be accepted
pub const EXPIRY_MARGIN_SECS: i64 = 24 * 60 * 60;

/// Optional constraints a certificate is checked against
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateCheck<'a> {
    /// PEM private key the certificate's public key must match
    pub private_key: Option<&'a str>,
    /// PEM CA certificates, one of which must have signed the certificate
    pub ca: &'a [String],
    /// Hostnames that must all appear in the SAN list (or CN without SANs)
    pub hostnames: &'a [String],
}

/// Validate a PEM certificate against the current time
pub fn is_valid(cert_pem: &str, check: &CertificateCheck<'_>) -> bool {
    is_valid_at(cert_pem, check, chrono::Utc::now().timestamp())
}

/// Validate a PEM certificate as if the current time were `now` (Unix seconds)
pub fn is_valid_at(cert_pem: &str, check: &CertificateCheck<'_>, now: i64) -> bool {
    match check_certificate(cert_pem, check, now) {
        Ok(()) => true,
        Err(reason) => {
            debug!(%reason, "Certificate rejected");
            false
        }
    }
}

fn check_certificate(cert_pem: &str, check: &CertificateCheck<'_>, now: i64) -> Result<(), String> {
    let pem = ::pem::parse(cert_pem).map_err(|e| format!("failed to parse PEM: {}", e))?;
    if pem.tag() != "CERTIFICATE" {
        return Err(format!("unexpected PEM block '{}'", pem.tag()));
    }
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| format!("failed to parse certificate: {}", e))?;

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    if now < not_before {
        return Err("certificate not yet valid".to_string());
    }
    if now + EXPIRY_MARGIN_SECS >= not_after {
        return Err("certificate expires within 24 hours".to_string());
    }

    if !check.ca.is_empty() {
        verify_chain(&cert, check.ca)?;
    }

    if let Some(key_pem) = check.private_key {
        let private = parse_rsa_private_key(key_pem).map_err(|e| e.to_string())?;
        let expected = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .map_err(|e| format!("failed to encode public key: {}", e))?;
        let actual: &[u8] = cert.public_key().subject_public_key.data.as_ref();
        if expected.as_bytes() != actual {
            return Err("private key does not match certificate".to_string());
        }
    }

    if !check.hostnames.is_empty() {
        let names = certificate_names(&cert)?;
        if let Some(missing) = check
            .hostnames
            .iter()
            .find(|required| !names.iter().any(|name| name.eq_ignore_ascii_case(required)))
        {
            return Err(format!("hostname '{}' not covered by certificate", missing));
        }
    }

    Ok(())
}

/// Check the certificate was signed by any certificate in the CA set
fn verify_chain(cert: &X509Certificate<'_>, ca_pems: &[String]) -> Result<(), String> {
    let mut blocks = Vec::new();
    for ca_pem in ca_pems {
        let parsed =
            ::pem::parse_many(ca_pem).map_err(|e| format!("failed to parse CA PEM: {}", e))?;
        blocks.extend(parsed);
    }

    for block in &blocks {
        let Ok((_, ca)) = X509Certificate::from_der(block.contents()) else {
            continue;
        };
        if cert.verify_signature(Some(ca.public_key())).is_ok() {
            return Ok(());
        }
    }
    Err("certificate not signed by any supplied CA".to_string())
}

/// DNS names from the SAN extension, or the subject CN when there is none
fn certificate_names(cert: &X509Certificate<'_>) -> Result<Vec<String>, String> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => Ok(san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect()),
        Ok(None) => Ok(cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .map(str::to_string)
            .collect()),
        Err(e) => Err(format!("failed to read SAN extension: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::issue::{create_tls_certificate, TlsCertificateParams};
    use crate::tls::keys::tests::shared_key;
    use crate::tls::keys::generate_rsa_key_pair;
    use crate::tls::CertificatePair;

    async fn self_signed(common_name: &str, alt_names: &[&str]) -> CertificatePair {
        create_tls_certificate(TlsCertificateParams {
            alt_names: alt_names.iter().map(|s| s.to_string()).collect(),
            private_key: Some(shared_key().private_pem.clone()),
            ..TlsCertificateParams::new(common_name)
        })
        .await
        .unwrap()
    }

    fn not_after(pem: &str) -> i64 {
        let block = ::pem::parse(pem).unwrap();
        let (_, cert) = X509Certificate::from_der(block.contents()).unwrap();
        cert.validity().not_after.timestamp()
    }

    #[tokio::test]
    async fn test_fresh_certificate_valid_until_margin() {
        let pair = self_signed("host.example.com", &[]).await;
        let check = CertificateCheck {
            private_key: Some(&pair.key),
            ..Default::default()
        };
        assert!(is_valid(&pair.crt, &check));

        let expiry = not_after(&pair.crt);
        assert!(is_valid_at(&pair.crt, &check, expiry - EXPIRY_MARGIN_SECS - 60));
        assert!(!is_valid_at(&pair.crt, &check, expiry - EXPIRY_MARGIN_SECS + 1));
        assert!(!is_valid_at(&pair.crt, &check, expiry + 1));
    }

    #[tokio::test]
    async fn test_not_yet_valid() {
        let pair = self_signed("host.example.com", &[]).await;
        let check = CertificateCheck::default();
        let an_hour_ago = chrono::Utc::now().timestamp() - 3600;
        assert!(!is_valid_at(&pair.crt, &check, an_hour_ago));
    }

    #[tokio::test]
    async fn test_hostname_must_be_in_san() {
        let pair = self_signed("a.example.com", &["b.example.com"]).await;
        let wanted = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let ok = wanted(&["a.example.com", "B.example.com"]);
        assert!(is_valid(
            &pair.crt,
            &CertificateCheck {
                hostnames: &ok,
                ..Default::default()
            }
        ));

        let missing = wanted(&["c.example.com"]);
        assert!(!is_valid(
            &pair.crt,
            &CertificateCheck {
                hostnames: &missing,
                ..Default::default()
            }
        ));
    }

    #[tokio::test]
    async fn test_key_mismatch_rejected() {
        let pair = self_signed("host.example.com", &[]).await;
        let other = generate_rsa_key_pair(2048).unwrap();
        let check = CertificateCheck {
            private_key: Some(&other.private_pem),
            ..Default::default()
        };
        assert!(!is_valid(&pair.crt, &check));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(!is_valid("", &CertificateCheck::default()));
        assert!(!is_valid(
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
            &CertificateCheck::default()
        ));
        assert!(!is_valid(&shared_key().private_pem, &CertificateCheck::default()));
    }

    #[test]
    fn test_common_name_used_without_san() {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "a.example.com");
        params.subject_alt_names = Vec::new();
        let key = rcgen::KeyPair::from_pem(&shared_key().private_pem).unwrap();
        let crt = params.self_signed(&key).unwrap().pem();

        let wanted = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let matching = wanted(&["A.example.com"]);
        assert!(is_valid(
            &crt,
            &CertificateCheck {
                hostnames: &matching,
                ..Default::default()
            }
        ));

        let other = wanted(&["b.example.com"]);
        assert!(!is_valid(
            &crt,
            &CertificateCheck {
                hostnames: &other,
                ..Default::default()
            }
        ));
    }
}
