//! Docker engine mutual-TLS material
//!
//! The CA and client leaf are kept in settings; the engine's copy of the CA
//! and its server leaf are files in the engine's TLS directory.

use std::path::Path;
use tracing::{debug, info};

use super::BootContext;
use crate::config::restrict_permissions;
use crate::tls::{renew_hierarchy, ServerFiles};
use crate::types::Result;

pub const SERVER_CA_FILE: &str = "ca.pem";
pub const SERVER_CERT_FILE: &str = "server-cert.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";

/// Validate the hierarchy and replace whatever is invalid
///
/// Renewed server files are written owner-only; every write must succeed
/// before the task completes.
pub async fn ensure_docker_tls_certificates(ctx: &BootContext) -> Result<()> {
    let dir = &ctx.args.docker_tls_dir;
    let settings = ctx.settings.get();

    let ca_path = dir.join(SERVER_CA_FILE);
    let crt_path = dir.join(SERVER_CERT_FILE);
    let key_path = dir.join(SERVER_KEY_FILE);

    let (ca, crt, key) = tokio::try_join!(
        read_optional(&ca_path),
        read_optional(&crt_path),
        read_optional(&key_path),
    )?;
    let files = ServerFiles { ca, crt, key };

    let renewal = renew_hierarchy(
        settings.tls.ca.as_ref(),
        settings.tls.client.as_ref(),
        &files,
        &settings.hostnames,
        ctx.key_bits,
    )
    .await?;

    if renewal.is_unchanged() {
        info!(dir = %dir.display(), "Docker TLS certificates valid");
        return Ok(());
    }

    let hierarchy = renewal.hierarchy;
    if renewal.server_renewed {
        tokio::fs::create_dir_all(dir).await?;
        tokio::try_join!(
            write_private(&ca_path, &hierarchy.ca.crt),
            write_private(&crt_path, &hierarchy.server.crt),
            write_private(&key_path, &hierarchy.server.key),
        )?;
        info!(dir = %dir.display(), "Docker server TLS files written");
    }

    if renewal.ca_renewed || renewal.client_renewed {
        ctx.settings.update(|s| {
            s.tls.ca = Some(hierarchy.ca);
            s.tls.client = Some(hierarchy.client);
        });
        ctx.settings.save().await?;
        info!(
            ca_renewed = renewal.ca_renewed,
            client_renewed = renewal.client_renewed,
            "Cluster TLS certificates saved"
        );
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "TLS file not found");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace a file's contents, then restrict it to the owner
async fn write_private(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    restrict_permissions(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::context;
    use crate::config::Settings;
    use crate::tls::{is_valid, CertificateCheck};

    fn settings() -> Settings {
        Settings {
            hostnames: vec!["node1.example.com".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_boot_then_drift() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "http://127.0.0.1:1", settings());
        let tls_dir = ctx.args.docker_tls_dir.clone();

        ensure_docker_tls_certificates(&ctx).await.unwrap();
        let stored = ctx.settings.get().tls;
        let ca = stored.ca.clone().unwrap();
        assert!(stored.client.is_some());
        assert!(dir.path().join("settings.json").exists());

        let disk_ca = std::fs::read_to_string(tls_dir.join(SERVER_CA_FILE)).unwrap();
        assert_eq!(disk_ca.trim(), ca.crt.trim());
        let server_crt = std::fs::read_to_string(tls_dir.join(SERVER_CERT_FILE)).unwrap();
        let server_key = std::fs::read_to_string(tls_dir.join(SERVER_KEY_FILE)).unwrap();
        let ca_set = vec![ca.crt.clone()];
        assert!(is_valid(
            &server_crt,
            &CertificateCheck {
                private_key: Some(&server_key),
                ca: &ca_set,
                hostnames: &ctx.settings.get().hostnames,
            }
        ));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for file in [SERVER_CA_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE] {
                let mode = std::fs::metadata(tls_dir.join(file)).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o600, "{}", file);
            }
        }

        // Valid and in sync: nothing changes
        ensure_docker_tls_certificates(&ctx).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tls_dir.join(SERVER_CERT_FILE)).unwrap(),
            server_crt
        );

        // Someone replaced the engine's CA: only the server side is rewritten
        std::fs::write(tls_dir.join(SERVER_CA_FILE), "stale").unwrap();
        ensure_docker_tls_certificates(&ctx).await.unwrap();
        assert_eq!(ctx.settings.get().tls, stored);
        let disk_ca = std::fs::read_to_string(tls_dir.join(SERVER_CA_FILE)).unwrap();
        assert_eq!(disk_ca.trim(), ca.crt.trim());
        assert_ne!(
            std::fs::read_to_string(tls_dir.join(SERVER_CERT_FILE)).unwrap(),
            server_crt
        );
    }
}
