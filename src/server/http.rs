//! Front door HTTP server
//!
//! Uses hyper http1 with TokioIo, over tokio-rustls unless plain HTTP is
//! forced. Every request passes through:
//! 1. session resolution (cookie)
//! 2. OAuth2 callback handling when the query carries `code` and `state`
//! 3. the access-token gate, redirecting to the authority when absent
//! 4. the proxy router

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::{HOST, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::response::{bad_request_response, error_response, redirect_response, BoxBody};
use super::tls::tls_acceptor;
use crate::auth::{resolve_session, OAuth2Client, Session, SessionStore};
use crate::config::{Args, SettingsStore};
use crate::proxy::{is_upgrade_request, ProxyRouter, Routed};
use crate::types::{GatewayError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub settings: Arc<SettingsStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub oauth2: Arc<OAuth2Client>,
    pub router: ProxyRouter,
}

impl AppState {
    pub fn new(
        args: Args,
        settings: Arc<SettingsStore>,
        sessions: Arc<dyn SessionStore>,
        oauth2: Arc<OAuth2Client>,
        router: ProxyRouter,
    ) -> Self {
        Self {
            args,
            settings,
            sessions,
            oauth2,
            router,
        }
    }

    /// Whether the front door is served over TLS
    pub fn secure(&self) -> bool {
        !self.settings.get().insecure_transport()
    }
}

/// Serve the front door until the listener fails
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let settings = state.settings.get();
    let (port, acceptor) = if settings.insecure_transport() {
        (settings.ports.http, None)
    } else {
        (settings.ports.https, Some(tls_acceptor(&settings.https)?))
    };

    let addr = SocketAddr::new(state.args.bind_address, port);
    let listener = TcpListener::bind(addr).await?;
    info!(
        %addr,
        tls = acceptor.is_some(),
        hostnames = ?settings.hostnames,
        "Front door listening"
    );
    if acceptor.is_none() {
        warn!("Plain HTTP mode - session cookies and tokens travel unencrypted");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, peer, state).await,
                            Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                        },
                        None => serve_connection(stream, peer, state).await,
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn serve_connection<I>(io: I, peer: SocketAddr, state: Arc<AppState>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(state, req).await }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!(%peer, error = %err, "Connection closed");
    }
}

/// Handle one front door request
///
/// Errors mean the connection is dropped without a response.
pub async fn handle_request<B>(state: Arc<AppState>, req: Request<B>) -> Result<Response<BoxBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let secure = state.secure();
    let (mut session, set_cookie) = resolve_session(
        state.sessions.as_ref(),
        req.headers(),
        &state.args.session_cookie,
        secure,
    );

    debug!(method = %req.method(), uri = %req.uri(), "Front door request");
    let mut response = front_door(&state, &mut session, req, secure).await?;
    if let Some(cookie) = set_cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn front_door<B>(
    state: &AppState,
    session: &mut Session,
    req: Request<B>,
    secure: bool,
) -> Result<Response<BoxBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let upgrade = is_upgrade_request(&req);
    let callback = OAuth2Callback::from_uri(req.uri());

    // Only a session waiting on the authority owns `code`/`state`; for
    // everyone else they belong to the container app.
    let pending = session.oauth2_state.is_some();
    if let (true, Some(code), Some(oauth2_state)) = (pending, &callback.code, &callback.state) {
        let Some(redirect_uri) = absolute_url(&req, &callback.target, secure) else {
            return Ok(bad_request_response("Missing Host header"));
        };
        let result = state
            .oauth2
            .complete_authorization(session, code, oauth2_state, &redirect_uri)
            .await;
        state.sessions.save(session.clone());

        return Ok(match result {
            Ok(()) => redirect_response(StatusCode::FOUND, &callback.target),
            Err(e) => {
                warn!(error = %e, "Authorization callback rejected");
                error_response(StatusCode::FORBIDDEN, "Authorization failed")
            }
        });
    }

    let Some(access_token) = session.access_token.clone() else {
        if upgrade {
            return Err(GatewayError::ConnectionClosed(
                "upgrade request without authorization".to_string(),
            ));
        }
        let Some(redirect_uri) = absolute_url(&req, &callback.target, secure) else {
            return Ok(bad_request_response("Missing Host header"));
        };
        let authorize = match state.oauth2.authorization_url(session, &redirect_uri) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Failed to build authorization URL");
                return Ok(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Authorization unavailable",
                ));
            }
        };
        state.sessions.save(session.clone());
        debug!(redirect_uri = %redirect_uri, "Redirecting to authority for authorization");
        return Ok(redirect_response(StatusCode::FOUND, &authorize));
    };

    let routed = state.router.route(req, &mut session.proxy_memory);
    state.sessions.save(session.clone());

    match routed {
        Routed::Forward(proxied) => Ok(state.router.forward(proxied, &access_token).await),
        Routed::Respond(response) => Ok(response),
        Routed::Close => Err(GatewayError::ConnectionClosed(
            "upgrade request cannot be redirected".to_string(),
        )),
    }
}

/// Request target split into OAuth2 callback parameters and everything else
#[derive(Debug, Clone, PartialEq, Eq)]
struct OAuth2Callback {
    code: Option<String>,
    state: Option<String>,
    /// Path and remaining query
    target: String,
}

impl OAuth2Callback {
    /// Split out `code` and `state`; the other pairs are kept byte for byte
    fn from_uri(uri: &Uri) -> Self {
        let path = uri.path();
        let mut code = None;
        let mut state = None;
        let mut rest = Vec::new();

        for pair in uri.query().unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let key = pair.split_once('=').map_or(pair, |(key, _)| key);
            let slot = match key {
                "code" => &mut code,
                "state" => &mut state,
                _ => {
                    rest.push(pair);
                    continue;
                }
            };
            *slot = serde_urlencoded::from_str::<Vec<(String, String)>>(pair)
                .ok()
                .and_then(|decoded| decoded.into_iter().next())
                .map(|(_, value)| value);
        }

        let target = if rest.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, rest.join("&"))
        };
        Self {
            code,
            state,
            target,
        }
    }
}

/// `scheme://host/target` for the request's Host header
fn absolute_url<B>(req: &Request<B>, target: &str, secure: bool) -> Option<String> {
    let host = req.headers().get(HOST)?.to_str().ok()?;
    if host.is_empty() {
        return None;
    }
    let scheme = if secure { "https" } else { "http" };
    Some(format!("{}://{}{}", scheme, host, target))
}
