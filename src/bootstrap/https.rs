//! Public HTTPS certificate provisioning

use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};
use tracing::{info, warn};

use super::BootContext;
use crate::tls::{
    create_https_certificate, create_tls_certificate, is_valid, AcmeRequest, CertificateCheck,
    TlsCertificateParams,
};
use crate::types::{GatewayError, Result};

/// Make sure the front door has a valid certificate for every hostname
///
/// Skipped in plain HTTP mode. A self-signed certificate is issued when
/// `security.forceInsecure` is set, otherwise the certificate comes from ACME.
pub async fn ensure_https_certificates(ctx: &BootContext) -> Result<()> {
    let settings = ctx.settings.get();
    if settings.security.force_http {
        info!("Plain HTTP mode, skipping HTTPS certificates");
        return Ok(());
    }

    let hostnames = &settings.hostnames;
    let Some(primary) = settings.primary_hostname() else {
        return Err(GatewayError::Config(
            "at least one hostname is required for HTTPS".to_string(),
        ));
    };

    if let (Some(crt), Some(key)) = (&settings.https.crt, &settings.https.key) {
        let check = CertificateCheck {
            private_key: Some(key.as_str()),
            ca: &settings.https.ca,
            hostnames,
        };
        if is_valid(crt, &check) {
            info!(hostnames = ?hostnames, "HTTPS certificate valid");
            return Ok(());
        }
        warn!("HTTPS certificate invalid, renewing");
    }

    if settings.security.force_insecure {
        let certificate = create_tls_certificate(TlsCertificateParams {
            alt_names: hostnames.iter().skip(1).cloned().collect(),
            key_usages: vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ServerAuth],
            key_bits: ctx.key_bits,
            ..TlsCertificateParams::new(primary)
        })
        .await?;

        ctx.settings.update(|s| {
            s.https.crt = Some(certificate.crt);
            s.https.key = Some(certificate.key);
            s.https.ca = Vec::new();
        });
        ctx.settings.save().await?;
        warn!(hostnames = ?hostnames, "Insecure mode, using a self-signed HTTPS certificate");
        return Ok(());
    }

    let email = settings
        .letsencrypt
        .email
        .clone()
        .unwrap_or_else(|| format!("admin@{}", primary));

    let issued = create_https_certificate(AcmeRequest {
        directory_url: &ctx.args.acme_directory_url,
        email: &email,
        hostnames,
        account_key: settings.letsencrypt.key.as_deref(),
        challenges: &ctx.challenges,
        key_bits: ctx.key_bits,
    })
    .await?;

    ctx.settings.update(|s| {
        s.https.crt = Some(issued.certificate.crt);
        s.https.key = Some(issued.certificate.key);
        s.https.ca = issued.ca;
        s.letsencrypt.email = Some(email);
        s.letsencrypt.key = Some(issued.account_key);
    });
    ctx.settings.save().await?;
    info!(hostnames = ?hostnames, "HTTPS certificate issued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::context;
    use crate::config::{Security, Settings};

    fn settings(force_http: bool, force_insecure: bool) -> Settings {
        Settings {
            hostnames: vec!["node1.example.com".to_string(), "node1.internal".to_string()],
            security: Security {
                force_http,
                force_insecure,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plain_http_skips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "http://127.0.0.1:1", settings(true, false));
        ensure_https_certificates(&ctx).await.unwrap();
        assert!(ctx.settings.get().https.crt.is_none());
        assert!(!dir.path().join("settings.json").exists());
    }

    #[tokio::test]
    async fn test_insecure_self_signed_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "http://127.0.0.1:1", settings(false, true));

        ensure_https_certificates(&ctx).await.unwrap();
        let first = ctx.settings.get().https;
        let crt = first.crt.clone().unwrap();
        let hostnames = ctx.settings.get().hostnames;
        assert!(is_valid(
            &crt,
            &CertificateCheck {
                private_key: first.key.as_deref(),
                hostnames: &hostnames,
                ..Default::default()
            }
        ));
        assert!(dir.path().join("settings.json").exists());

        // Still valid: nothing is reissued
        ensure_https_certificates(&ctx).await.unwrap();
        assert_eq!(ctx.settings.get().https, first);
    }

    #[tokio::test]
    async fn test_requires_hostnames() {
        let dir = tempfile::tempdir().unwrap();
        let mut no_hosts = settings(false, true);
        no_hosts.hostnames.clear();
        let ctx = context(dir.path(), "http://127.0.0.1:1", no_hosts);
        assert!(matches!(
            ensure_https_certificates(&ctx).await,
            Err(GatewayError::Config(_))
        ));
    }
}
