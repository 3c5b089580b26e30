//! ACME (Let's Encrypt) issuance over HTTP-01
//!
//! 1. Load or register the ACME account, generating the certificate key in parallel
//! 2. Order a certificate for every hostname
//! 3. Publish each key authorization in the [`ChallengeStore`], which the
//!    plain-HTTP forwarder serves under [`ACME_CHALLENGE_PREFIX`]
//! 4. Poll until the order is ready, finalize with a CSR, download the chain
//!
//! Failures are returned to the caller; nothing here retries.

use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::keys::generate_rsa_key;
use super::{CertificateError, CertificatePair};

/// URL prefix the ACME server fetches challenge responses from
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Maximum order status polls before giving up
const ORDER_POLL_ATTEMPTS: u32 = 10;

/// Pending HTTP-01 challenges (token -> key authorization)
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens.insert(token.into(), key_authorization.into());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Input for [`create_https_certificate`]
pub struct AcmeRequest<'a> {
    pub directory_url: &'a str,
    pub email: &'a str,
    pub hostnames: &'a [String],
    /// Serialized account credentials from an earlier registration
    pub account_key: Option<&'a str>,
    pub challenges: &'a ChallengeStore,
    pub key_bits: usize,
}

/// Issued HTTPS material
#[derive(Debug, Clone)]
pub struct HttpsCertificate {
    /// Leaf certificate and its private key
    pub certificate: CertificatePair,
    /// Intermediate certificates following the leaf
    pub ca: Vec<String>,
    /// Serialized account credentials to persist for the next renewal
    pub account_key: String,
}

/// Obtain a certificate for all hostnames from an ACME server
pub async fn create_https_certificate(
    request: AcmeRequest<'_>,
) -> Result<HttpsCertificate, CertificateError> {
    if request.hostnames.is_empty() {
        return Err(CertificateError::Acme("no hostnames to certify".to_string()));
    }

    let mut published = Vec::new();
    let result = issue(&request, &mut published).await;
    for token in &published {
        request.challenges.remove(token);
    }
    result
}

async fn issue(
    request: &AcmeRequest<'_>,
    published: &mut Vec<String>,
) -> Result<HttpsCertificate, CertificateError> {
    let ((account, account_key), cert_key) = tokio::try_join!(
        load_or_register(request),
        generate_rsa_key(request.key_bits)
    )?;

    let identifiers: Vec<Identifier> = request
        .hostnames
        .iter()
        .map(|hostname| Identifier::Dns(hostname.clone()))
        .collect();
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await?;

    let authorizations = order.authorizations().await?;
    for authz in &authorizations {
        match authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            ref status => {
                return Err(CertificateError::AcmeOrder {
                    identifier: format!("{:?}", authz.identifier),
                    status: format!("{:?}", status),
                })
            }
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| {
                CertificateError::Acme(format!(
                    "no http-01 challenge offered for {:?}",
                    authz.identifier
                ))
            })?;

        let key_authorization = order.key_authorization(challenge);
        request
            .challenges
            .insert(challenge.token.clone(), key_authorization.as_str());
        published.push(challenge.token.clone());

        debug!(identifier = ?authz.identifier, token = %challenge.token, "Challenge published");
        order.set_challenge_ready(&challenge.url).await?;
    }

    let mut delay = Duration::from_millis(250);
    let mut attempts = 0;
    loop {
        tokio::time::sleep(delay).await;
        let state = order.refresh().await?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => break,
            OrderStatus::Invalid => {
                return Err(CertificateError::AcmeOrder {
                    identifier: request.hostnames.join(","),
                    status: "invalid".to_string(),
                })
            }
            _ => {}
        }

        attempts += 1;
        if attempts >= ORDER_POLL_ATTEMPTS {
            return Err(CertificateError::Acme(format!(
                "order not ready after {} polls",
                attempts
            )));
        }
        delay = (delay * 2).min(Duration::from_secs(10));
    }

    let key_pair = KeyPair::from_pem(&cert_key.private_pem)
        .map_err(|e| CertificateError::Parse(format!("failed to load certificate key: {}", e)))?;
    let mut params = CertificateParams::new(request.hostnames.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params.serialize_request(&key_pair)?;
    order.finalize(csr.der().as_ref()).await?;

    let mut attempts = 0;
    let chain = loop {
        if let Some(chain) = order.certificate().await? {
            break chain;
        }
        attempts += 1;
        if attempts >= ORDER_POLL_ATTEMPTS {
            return Err(CertificateError::Acme(
                "certificate not issued after finalization".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };

    let mut blocks = split_chain(&chain).into_iter();
    let leaf = blocks
        .next()
        .ok_or_else(|| CertificateError::Parse("ACME server returned an empty chain".to_string()))?;

    info!(hostnames = ?request.hostnames, "ACME certificate issued");
    Ok(HttpsCertificate {
        certificate: CertificatePair {
            crt: leaf,
            key: cert_key.private_pem,
        },
        ca: blocks.collect(),
        account_key,
    })
}

/// Reuse the stored account, or register a new one
async fn load_or_register(
    request: &AcmeRequest<'_>,
) -> Result<(Account, String), CertificateError> {
    if let Some(stored) = request.account_key {
        let credentials: AccountCredentials = serde_json::from_str(stored).map_err(|e| {
            CertificateError::Parse(format!("invalid stored ACME account: {}", e))
        })?;
        let account = Account::from_credentials(credentials).await?;
        debug!("Using existing ACME account");
        return Ok((account, stored.to_string()));
    }

    let contact = format!("mailto:{}", request.email);
    let (account, credentials) = Account::create(
        &NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        },
        request.directory_url,
        None,
    )
    .await?;
    let serialized = serde_json::to_string(&credentials)
        .map_err(|e| CertificateError::Acme(format!("failed to serialize account: {}", e)))?;

    info!(email = %request.email, "Registered ACME account");
    Ok((account, serialized))
}

/// Split a PEM chain into individual certificate blocks
fn split_chain(chain: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    chain
        .split_inclusive(END)
        .map(str::trim)
        .filter(|block| block.starts_with("-----BEGIN CERTIFICATE-----"))
        .map(|block| format!("{}\n", block))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_store_roundtrip() {
        let store = ChallengeStore::new();
        let shared = store.clone();
        store.insert("tok", "tok.thumbprint");
        assert_eq!(shared.get("tok").as_deref(), Some("tok.thumbprint"));
        shared.remove("tok");
        assert!(store.get("tok").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_split_chain() {
        let chain = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n\n\
                     -----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let blocks = split_chain(chain);
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n"
        );
        assert!(blocks[1].contains("BBB"));
        assert!(split_chain("").is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_hostnames() {
        let challenges = ChallengeStore::new();
        let result = create_https_certificate(AcmeRequest {
            directory_url: "http://127.0.0.1:1/directory",
            email: "admin@example.com",
            hostnames: &[],
            account_key: None,
            challenges: &challenges,
            key_bits: 2048,
        })
        .await;
        assert!(matches!(result, Err(CertificateError::Acme(_))));
    }
}
