//! Host registration with the central authority

use tracing::info;

use super::BootContext;
use crate::auth::{ApiRequest, Credentials};
use crate::types::{GatewayError, Result};

fn host_path(hostname: &str) -> String {
    format!("/api/hosts/{}", urlencoding::encode(hostname))
}

fn primary_hostname(ctx: &BootContext) -> Result<String> {
    ctx.settings
        .get()
        .primary_hostname()
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Config("no hostname configured".to_string()))
}

/// Confirm the authority knows this host and accepts its client credentials
pub async fn verify_authority_access(ctx: &BootContext) -> Result<()> {
    let hostname = primary_hostname(ctx)?;
    let path = host_path(&hostname);
    let response = ctx
        .oauth2
        .request(ApiRequest::get(&path, Credentials::Service))
        .await?;

    if !response.is_success() {
        return Err(GatewayError::Authority(format!(
            "host {} not accepted by authority ({})",
            hostname, response.status
        )));
    }
    info!(%hostname, "Authority access verified");
    Ok(())
}

/// Publish the cluster client certificate so the authority can reach the Docker engine
pub async fn register_docker_client(ctx: &BootContext) -> Result<()> {
    let hostname = primary_hostname(ctx)?;
    let tls = ctx.settings.get().tls;
    let (Some(ca), Some(client)) = (tls.ca, tls.client) else {
        return Err(GatewayError::Config(
            "cluster TLS certificates missing".to_string(),
        ));
    };

    let body = serde_json::json!({
        "hostname": hostname,
        "port": ctx.args.docker_tls_port,
        "ca": ca.crt,
        "crt": client.crt,
        "key": client.key,
    });
    let path = host_path(&hostname);
    let response = ctx
        .oauth2
        .request(ApiRequest::post(&path, body, Credentials::Service))
        .await?;

    if !response.is_success() {
        return Err(GatewayError::Authority(format!(
            "registration of {} rejected ({})",
            hostname, response.status
        )));
    }
    info!(%hostname, port = ctx.args.docker_tls_port, "Docker client registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth2::tests::spawn_stub;
    use crate::bootstrap::tests::context;
    use crate::config::{Settings, TlsMaterial};
    use crate::tls::CertificatePair;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::{Method, Request, Response, StatusCode};
    use std::sync::{Arc, Mutex};

    fn settings() -> Settings {
        Settings {
            hostnames: vec!["node1.example.com".to_string()],
            tls: TlsMaterial {
                ca: Some(CertificatePair {
                    crt: "ca-crt".to_string(),
                    key: "ca-key".to_string(),
                }),
                client: Some(CertificatePair {
                    crt: "client-crt".to_string(),
                    key: "client-key".to_string(),
                }),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_verify_and_register() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let base = spawn_stub(move |req: Request<Incoming>| {
            let known = req.uri().path() == "/api/hosts/node1.example.com"
                && req
                    .uri()
                    .query()
                    .is_some_and(|q| q.contains("client_secret=host-secret"));
            recorder
                .lock()
                .unwrap()
                .push(format!("{} {}", req.method(), req.uri().path()));
            let status = match (known, req.method()) {
                (true, &Method::GET) | (true, &Method::POST) => StatusCode::OK,
                _ => StatusCode::NOT_FOUND,
            };
            Response::builder()
                .status(status)
                .body(Full::new(Bytes::from("{}")))
                .unwrap()
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &base, settings());
        verify_authority_access(&ctx).await.unwrap();
        register_docker_client(&ctx).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "GET /api/hosts/node1.example.com".to_string(),
                "POST /api/hosts/node1.example.com".to_string()
            ]
        );

        let mut unknown = settings();
        unknown.hostnames = vec!["stranger.example.com".to_string()];
        let ctx = context(dir.path(), &base, unknown);
        assert!(matches!(
            verify_authority_access(&ctx).await,
            Err(GatewayError::Authority(_))
        ));
    }

    #[tokio::test]
    async fn test_register_requires_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let mut no_tls = settings();
        no_tls.tls = TlsMaterial::default();
        let ctx = context(dir.path(), "http://127.0.0.1:1", no_tls);
        assert!(matches!(
            register_docker_client(&ctx).await,
            Err(GatewayError::Config(_))
        ));
    }
}
