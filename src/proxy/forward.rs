//! Byte-transparent forwarding to a local port
//!
//! Requests are relayed with their method, headers and streaming body.
//! Upgrade handshakes are relayed as-is; once the upstream answers 101 the
//! response goes back to the client and both upgraded connections are piped
//! into each other until either side closes.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::header::UPGRADE;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::server::response::BoxBody;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream port {port} unreachable: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper::Error),
}

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(UPGRADE)
}

/// Send `req` to `127.0.0.1:host_port` and relay the response
pub async fn forward<B>(mut req: Request<B>, host_port: u16) -> Result<Response<BoxBody>, ForwardError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let client_upgrade = is_upgrade_request(&req).then(|| hyper::upgrade::on(&mut req));

    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, host_port))
        .await
        .map_err(|source| ForwardError::Connect {
            port: host_port,
            source,
        })?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(port = host_port, error = %e, "Upstream connection closed with error");
        }
    });

    let mut response = sender
        .send_request(req)
        .await
        .map_err(ForwardError::Request)?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(pipe(client_upgrade, upstream_upgrade, host_port));
        }
    }

    Ok(response.map(|body| body.boxed()))
}

async fn pipe(client: OnUpgrade, upstream: OnUpgrade, port: u16) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(port, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(port, to_upstream, to_client, "Upgraded connection closed")
        }
        Err(e) => debug!(port, error = %e, "Upgraded connection aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Upstream that echoes the request line, or echoes bytes after an upgrade
    async fn spawn_upstream() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|mut req: Request<Incoming>| async move {
                        if is_upgrade_request(&req) {
                            let on_upgrade = hyper::upgrade::on(&mut req);
                            tokio::spawn(async move {
                                let upgraded = on_upgrade.await.unwrap();
                                let mut io = TokioIo::new(upgraded);
                                let mut buf = [0u8; 4];
                                io.read_exact(&mut buf).await.unwrap();
                                io.write_all(&buf).await.unwrap();
                            });
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::SWITCHING_PROTOCOLS)
                                    .header("connection", "upgrade")
                                    .header("upgrade", "echo")
                                    .body(Full::new(Bytes::new()))
                                    .unwrap(),
                            );
                        }
                        let line = format!("{} {}", req.method(), req.uri());
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        Ok(Response::builder()
                            .header("x-upstream", "yes")
                            .body(Full::new(Bytes::from(format!(
                                "{} {}",
                                line,
                                String::from_utf8_lossy(&body)
                            ))))
                            .unwrap())
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_forwards_method_path_and_body() {
        let port = spawn_upstream().await;
        let req = Request::post("/api/items?x=1")
            .header("host", "node1.example.com")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();

        let response = forward(req, port).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream"], "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"POST /api/items?x=1 payload");
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let req = Request::get("/").body(Full::new(Bytes::new())).unwrap();
        assert!(matches!(
            forward(req, port).await,
            Err(ForwardError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_upgrade_is_piped() {
        let upstream_port = spawn_upstream().await;

        let front = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let front_port = front.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = front.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| async move {
                forward(req, upstream_port).await
            });
            let _ = server_http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await;
        });

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, front_port))
            .await
            .unwrap();
        client
            .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\n")
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
