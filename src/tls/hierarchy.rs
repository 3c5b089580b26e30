//! Cluster mutual-TLS hierarchy
//!
//! CA -> { client leaf, server leaf }. The CA and client leaf are persisted
//! in settings; the server leaf and a copy of the CA live in the Docker
//! engine's TLS directory. An invalid CA invalidates both leaves.

use tracing::{info, warn};

use super::issue::{create_tls_certificate, TlsCertificateParams};
use super::validate::{is_valid, CertificateCheck};
use super::{CertificateError, CertificatePair};

/// The three certificates of the hierarchy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateHierarchy {
    pub ca: CertificatePair,
    pub client: CertificatePair,
    pub server: CertificatePair,
}

/// Server-side TLS files as currently found on disk
#[derive(Debug, Clone, Default)]
pub struct ServerFiles {
    pub ca: Option<String>,
    pub crt: Option<String>,
    pub key: Option<String>,
}

/// Result of [`renew_hierarchy`]
#[derive(Debug, Clone)]
pub struct HierarchyRenewal {
    pub hierarchy: CertificateHierarchy,
    pub ca_renewed: bool,
    pub client_renewed: bool,
    pub server_renewed: bool,
}

impl HierarchyRenewal {
    pub fn is_unchanged(&self) -> bool {
        !(self.ca_renewed || self.client_renewed || self.server_renewed)
    }
}

/// Validate the hierarchy as a unit and regenerate whatever is invalid
///
/// The server leaf additionally requires the on-disk CA copy to match the
/// hierarchy CA after trimming whitespace.
pub async fn renew_hierarchy(
    ca: Option<&CertificatePair>,
    client: Option<&CertificatePair>,
    server: &ServerFiles,
    hostnames: &[String],
    key_bits: usize,
) -> Result<HierarchyRenewal, CertificateError> {
    let common_name = hostnames.first().cloned().unwrap_or_else(|| "localhost".to_string());

    let current_ca = ca.filter(|ca| {
        is_valid(
            &ca.crt,
            &CertificateCheck {
                private_key: Some(&ca.key),
                ..Default::default()
            },
        )
    });

    let Some(ca) = current_ca else {
        warn!("Cluster CA missing or invalid, regenerating CA, client and server certificates");
        let ca = create_tls_certificate(TlsCertificateParams {
            key_bits,
            ..TlsCertificateParams::certificate_authority(format!("{} CA", common_name))
        })
        .await?;
        let (client, server) = tokio::try_join!(
            issue_client(&common_name, &ca, key_bits),
            issue_server(hostnames, &ca, key_bits)
        )?;
        return Ok(HierarchyRenewal {
            hierarchy: CertificateHierarchy { ca, client, server },
            ca_renewed: true,
            client_renewed: true,
            server_renewed: true,
        });
    };

    let ca_set = vec![ca.crt.clone()];

    let current_client = client.filter(|client| {
        is_valid(
            &client.crt,
            &CertificateCheck {
                private_key: Some(&client.key),
                ca: &ca_set,
                ..Default::default()
            },
        )
    });

    let disk_ca_matches = server
        .ca
        .as_deref()
        .is_some_and(|disk| disk.trim() == ca.crt.trim());
    let current_server = match (&server.crt, &server.key) {
        (Some(crt), Some(key))
            if disk_ca_matches
                && is_valid(
                    crt,
                    &CertificateCheck {
                        private_key: Some(key),
                        ca: &ca_set,
                        hostnames,
                    },
                ) =>
        {
            Some(CertificatePair {
                crt: crt.clone(),
                key: key.clone(),
            })
        }
        _ => None,
    };

    let client_renewed = current_client.is_none();
    let server_renewed = current_server.is_none();

    let client = match current_client {
        Some(client) => client.clone(),
        None => {
            info!("Cluster client certificate invalid, regenerating");
            issue_client(&common_name, ca, key_bits).await?
        }
    };
    let server = match current_server {
        Some(server) => server,
        None => {
            info!(disk_ca_matches, "Cluster server certificate invalid, regenerating");
            issue_server(hostnames, ca, key_bits).await?
        }
    };

    Ok(HierarchyRenewal {
        hierarchy: CertificateHierarchy {
            ca: ca.clone(),
            client,
            server,
        },
        ca_renewed: false,
        client_renewed,
        server_renewed,
    })
}

async fn issue_client(
    common_name: &str,
    ca: &CertificatePair,
    key_bits: usize,
) -> Result<CertificatePair, CertificateError> {
    create_tls_certificate(TlsCertificateParams {
        key_bits,
        ..TlsCertificateParams::client(common_name, ca)
    })
    .await
}

async fn issue_server(
    hostnames: &[String],
    ca: &CertificatePair,
    key_bits: usize,
) -> Result<CertificatePair, CertificateError> {
    create_tls_certificate(TlsCertificateParams {
        key_bits,
        ..TlsCertificateParams::server(hostnames, ca)
    })
    .await
}
