//! Container port lookup
//!
//! Maps a (container, port) pair to the host port it is published on. The
//! authority owns the mapping; it is fetched per request and never cached.

use async_trait::async_trait;
use hyper::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use super::route::ProxyTarget;
use crate::auth::{ApiRequest, Credentials, OAuth2Client, OAuth2Error};

/// How the front door reaches a container port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    /// Forward through this proxy
    Https,
    /// Redirect the client to the published host port
    None,
    Unknown(String),
}

impl From<&str> for ProxyMode {
    fn from(value: &str) -> Self {
        match value {
            "https" => ProxyMode::Https,
            "none" => ProxyMode::None,
            other => ProxyMode::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub proxy_mode: ProxyMode,
}

#[derive(Debug, Error)]
pub enum PortLookupError {
    #[error("no mapping for {0}")]
    NotFound(ProxyTarget),

    #[error("port lookup unavailable: {0}")]
    Unavailable(String),

    #[error("port lookup failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait PortResolver: Send + Sync {
    async fn resolve(
        &self,
        access_token: &str,
        target: &ProxyTarget,
    ) -> Result<PortMapping, PortLookupError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortMappingBody {
    host_port: u16,
    proxy_mode: String,
}

/// Resolves mappings through the authority's API with the user's token
pub struct AuthorityPortResolver {
    oauth2: Arc<OAuth2Client>,
}

impl AuthorityPortResolver {
    pub fn new(oauth2: Arc<OAuth2Client>) -> Self {
        Self { oauth2 }
    }
}

#[async_trait]
impl PortResolver for AuthorityPortResolver {
    async fn resolve(
        &self,
        access_token: &str,
        target: &ProxyTarget,
    ) -> Result<PortMapping, PortLookupError> {
        let path = format!(
            "/api/containers/{}/ports/{}",
            urlencoding::encode(&target.container),
            target.port
        );
        let response = self
            .oauth2
            .request(ApiRequest::get(&path, Credentials::Token(access_token)))
            .await
            .map_err(|e| match e {
                OAuth2Error::Unreachable(msg) => PortLookupError::Unavailable(msg),
                other => PortLookupError::Other(other.to_string()),
            })?;

        match response.status {
            StatusCode::NOT_FOUND => Err(PortLookupError::NotFound(target.clone())),
            status if status.is_success() => {
                let body: PortMappingBody = response
                    .json()
                    .map_err(|e| PortLookupError::Other(e.to_string()))?;
                Ok(PortMapping {
                    host_port: body.host_port,
                    proxy_mode: ProxyMode::from(body.proxy_mode.as_str()),
                })
            }
            status => Err(PortLookupError::Other(format!(
                "authority returned {} for {}",
                status, target
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth2::tests::{client, spawn_stub};
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::{Request, Response};

    #[test]
    fn test_proxy_mode_parse() {
        assert_eq!(ProxyMode::from("https"), ProxyMode::Https);
        assert_eq!(ProxyMode::from("none"), ProxyMode::None);
        assert_eq!(
            ProxyMode::from("tcp"),
            ProxyMode::Unknown("tcp".to_string())
        );
    }

    #[tokio::test]
    async fn test_authority_lookup() {
        let base = spawn_stub(|req: Request<Incoming>| {
            let authorized = req
                .headers()
                .get("authorization")
                .is_some_and(|v| v == "token user-token");
            let (status, body) = match (authorized, req.uri().path()) {
                (false, _) => (StatusCode::UNAUTHORIZED, "{}"),
                (true, "/api/containers/abcdef0123456789/ports/8080") => {
                    (StatusCode::OK, r#"{"hostPort":32768,"proxyMode":"https"}"#)
                }
                (true, "/api/containers/abcdef0123456789/ports/22") => {
                    (StatusCode::OK, r#"{"hostPort":32769,"proxyMode":"ssh"}"#)
                }
                _ => (StatusCode::NOT_FOUND, "{}"),
            };
            Response::builder()
                .status(status)
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        })
        .await;
        let resolver = AuthorityPortResolver::new(Arc::new(client(&base)));

        let mapping = resolver
            .resolve("user-token", &ProxyTarget::new("abcdef0123456789", 8080))
            .await
            .unwrap();
        assert_eq!(mapping.host_port, 32768);
        assert_eq!(mapping.proxy_mode, ProxyMode::Https);

        let mapping = resolver
            .resolve("user-token", &ProxyTarget::new("abcdef0123456789", 22))
            .await
            .unwrap();
        assert_eq!(mapping.proxy_mode, ProxyMode::Unknown("ssh".to_string()));

        let missing = resolver
            .resolve("user-token", &ProxyTarget::new("0000000000000000", 80))
            .await;
        assert!(matches!(missing, Err(PortLookupError::NotFound(_))));

        let denied = resolver
            .resolve("other-token", &ProxyTarget::new("abcdef0123456789", 8080))
            .await;
        assert!(matches!(denied, Err(PortLookupError::Other(_))));
    }

    #[tokio::test]
    async fn test_unreachable_authority() {
        let resolver = AuthorityPortResolver::new(Arc::new(client("http://127.0.0.1:1")));
        let result = resolver
            .resolve("t", &ProxyTarget::new("abcdef0123456789", 80))
            .await;
        assert!(matches!(result, Err(PortLookupError::Unavailable(_))));
    }
}
