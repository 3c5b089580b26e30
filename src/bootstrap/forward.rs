//! Plain-HTTP forwarder
//!
//! Serves ACME HTTP-01 challenges so certificates can be issued before any
//! HTTPS listener exists, and redirects everything else to HTTPS.

use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::BootContext;
use crate::server::response::{
    bad_request_response, not_found_response, redirect_response, text_response, BoxBody,
};
use crate::tls::acme::ACME_CHALLENGE_PREFIX;
use crate::tls::ChallengeStore;
use crate::types::Result;

/// Start the forwarder on `ports.http` unless plain HTTP is forced
///
/// Completes once the listener is bound; serving continues in the background.
pub async fn forward_http(ctx: &BootContext) -> Result<()> {
    let settings = ctx.settings.get();
    if settings.security.force_http {
        info!("Plain HTTP mode, HTTP forwarder not started");
        return Ok(());
    }

    let addr = SocketAddr::new(ctx.args.bind_address, settings.ports.http);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, https_port = settings.ports.https, "HTTP forwarder listening");

    let challenges = ctx.challenges.clone();
    let https_port = settings.ports.https;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let challenges = challenges.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let response = forwarder_response(&req, &challenges, https_port);
                            async move { Ok::<_, Infallible>(response) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(%peer, error = %e, "Forwarder connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Forwarder accept failed"),
            }
        }
    });

    Ok(())
}

/// Answer a plain-HTTP request
pub fn forwarder_response<B>(
    req: &Request<B>,
    challenges: &ChallengeStore,
    https_port: u16,
) -> Response<BoxBody> {
    let path = req.uri().path();

    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        if req.method() != Method::GET {
            return not_found_response("Unknown challenge");
        }
        return match challenges.get(token) {
            Some(key_authorization) => {
                debug!(token, "Serving ACME challenge");
                text_response(StatusCode::OK, key_authorization)
            }
            None => not_found_response("Unknown challenge"),
        };
    }

    let Some(host) = req.headers().get(HOST).and_then(|h| h.to_str().ok()) else {
        return bad_request_response("Missing Host header");
    };
    let hostname = host
        .rsplit_once(':')
        .filter(|(_, port)| !port.ends_with(']'))
        .map_or(host, |(hostname, _)| hostname);
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", hostname, target)
    } else {
        format!("https://{}:{}{}", hostname, https_port, target)
    };
    redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::header::LOCATION;

    fn get(uri: &str, host: &str) -> Request<()> {
        Request::get(uri).header(HOST, host).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_known_challenge() {
        let challenges = ChallengeStore::new();
        challenges.insert("tok123", "tok123.thumb");

        let response = forwarder_response(
            &get("/.well-known/acme-challenge/tok123", "node1.example.com"),
            &challenges,
            443,
        );
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tok123.thumb");

        let response = forwarder_response(
            &get("/.well-known/acme-challenge/other", "node1.example.com"),
            &challenges,
            443,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redirects_to_https() {
        let challenges = ChallengeStore::new();

        let response = forwarder_response(&get("/a/b?c=d", "node1.example.com:80"), &challenges, 443);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://node1.example.com/a/b?c=d");

        let response = forwarder_response(&get("/", "node1.example.com"), &challenges, 8443);
        assert_eq!(response.headers()[LOCATION], "https://node1.example.com:8443/");

        let no_host = Request::get("/").body(()).unwrap();
        assert_eq!(
            forwarder_response(&no_host, &challenges, 443).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
