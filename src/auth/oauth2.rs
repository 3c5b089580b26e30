//! OAuth2 client for the central authority
//!
//! Two roles share the same primitives:
//! - service requests: this host calls the authority's API with its own
//!   client id/secret as query parameters (bootstrap, host registry)
//! - user delegation: authorization-code flow bound to a front-door
//!   session; the resulting token authorizes calls on the user's behalf
//!
//! Tokens are exchanged once and kept for the life of the session. Refresh
//! tokens returned by the authority are not used.

use bytes::Bytes;
use hyper::header::{ACCEPT, AUTHORIZATION};
use hyper::{Method, StatusCode};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::Session;

/// Authorization endpoint path on the authority
pub const AUTHORIZE_PATH: &str = "/login/oauth/authorize";
/// Token endpoint path on the authority
pub const TOKEN_PATH: &str = "/login/oauth/access_token";

/// Errors from the OAuth2 client
#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("no authorization pending for this session")]
    MissingState,

    #[error("state parameter does not match this session")]
    StateMismatch,

    #[error("code exchange failed: {0}")]
    Exchange(String),

    #[error("authority unreachable: {0}")]
    Unreachable(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

impl From<reqwest::Error> for OAuth2Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            OAuth2Error::Unreachable(e.to_string())
        } else {
            OAuth2Error::Transport(e.to_string())
        }
    }
}

/// Static client registration with the authority
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub authority_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

/// How an API request authenticates
#[derive(Debug, Clone, Copy)]
pub enum Credentials<'a> {
    /// `Authorization: token <access token>` on behalf of a user
    Token(&'a str),
    /// Client id and secret as query parameters
    Service,
}

/// A call to the authority's API
#[derive(Debug, Clone)]
pub struct ApiRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: Option<serde_json::Value>,
    pub credentials: Credentials<'a>,
}

impl<'a> ApiRequest<'a> {
    pub fn get(path: &'a str, credentials: Credentials<'a>) -> Self {
        Self {
            method: Method::GET,
            path,
            body: None,
            credentials,
        }
    }

    pub fn post(path: &'a str, body: serde_json::Value, credentials: Credentials<'a>) -> Self {
        Self {
            method: Method::POST,
            path,
            body: Some(body),
            credentials,
        }
    }
}

/// Raw API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, OAuth2Error> {
        serde_json::from_slice(&self.body).map_err(|e| OAuth2Error::InvalidBody(e.to_string()))
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub refresh_token: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// OAuth2 client bound to one authority
pub struct OAuth2Client {
    http: reqwest::Client,
    config: OAuth2Config,
}

impl OAuth2Client {
    pub fn new(config: OAuth2Config) -> Result<Self, OAuth2Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hostgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OAuth2Error::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.authority_url.trim_end_matches('/'), path)
    }

    /// Unguessable state value (20 random bytes, hex)
    pub fn generate_state() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Start an authorization: bind a fresh state to the session and return
    /// the URL to send the user to
    pub fn authorization_url(
        &self,
        session: &mut Session,
        redirect_uri: &str,
    ) -> Result<String, OAuth2Error> {
        let state = Self::generate_state();
        let url = reqwest::Url::parse_with_params(
            &self.url(AUTHORIZE_PATH),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", self.config.scope.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| OAuth2Error::InvalidUrl(e.to_string()))?;

        session.oauth2_state = Some(state);
        Ok(url.into())
    }

    /// Consume the session's pending state and compare it with the presented one
    pub fn verify_state(session: &mut Session, presented: &str) -> Result<(), OAuth2Error> {
        match session.oauth2_state.take() {
            None => Err(OAuth2Error::MissingState),
            Some(expected) if expected == presented => Ok(()),
            Some(_) => Err(OAuth2Error::StateMismatch),
        }
    }

    /// Exchange an authorization code for an access token
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String, OAuth2Error> {
        let response = self
            .http
            .post(self.url(TOKEN_PATH))
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(OAuth2Error::Exchange(format!("token endpoint returned {}", status)));
        }

        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| OAuth2Error::InvalidBody(e.to_string()))?;
        if let Some(error) = token.error {
            return Err(OAuth2Error::Exchange(match token.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            }));
        }
        if token.refresh_token.is_some() {
            debug!("Ignoring refresh token from authority");
        }
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuth2Error::Exchange("no access token in response".to_string()))
    }

    /// Handle the authorization callback for a session
    ///
    /// The state is consumed even when the exchange fails.
    pub async fn complete_authorization(
        &self,
        session: &mut Session,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<(), OAuth2Error> {
        if let Err(e) = Self::verify_state(session, state) {
            warn!(session = %short(&session.id), error = %e, "OAuth2 state rejected");
            return Err(e);
        }

        let token = self.exchange_code(code, redirect_uri).await?;
        session.access_token = Some(token);
        info!(session = %short(&session.id), "OAuth2 access granted");
        Ok(())
    }

    /// Authenticated call to the authority's API
    pub async fn request(&self, request: ApiRequest<'_>) -> Result<ApiResponse, OAuth2Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(request.path))
            .header(ACCEPT, "application/json");

        builder = match request.credentials {
            Credentials::Token(token) => builder.header(AUTHORIZATION, format!("token {}", token)),
            Credentials::Service => builder.query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ]),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(method = %request.method, path = %request.path, %status, "Authority request");
        Ok(ApiResponse { status, body })
    }
}

/// Session ids are secrets; only log a prefix
fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Serve `handler` on a random local port, returning its base URL
    pub(crate) async fn spawn_stub<F>(handler: F) -> String
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    pub(crate) fn client(authority_url: &str) -> OAuth2Client {
        OAuth2Client::new(OAuth2Config {
            authority_url: authority_url.to_string(),
            client_id: "host-client".to_string(),
            client_secret: "host-secret".to_string(),
            scope: "user:ports".to_string(),
        })
        .unwrap()
    }

    fn json(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[test]
    fn test_state_shape() {
        let state = OAuth2Client::generate_state();
        assert_eq!(state.len(), 40);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(state, OAuth2Client::generate_state());
    }

    #[test]
    fn test_authorization_url_binds_state() {
        let client = client("https://authority.example/");
        let mut session = Session::new("s1");
        let url = client
            .authorization_url(&mut session, "https://host.example/app?x=1")
            .unwrap();

        let parsed = reqwest::Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), AUTHORIZE_PATH);
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "host-client");
        assert_eq!(params["scope"], "user:ports");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://host.example/app?x=1");
        assert_eq!(Some(&params["state"]), session.oauth2_state.as_ref());
    }

    #[test]
    fn test_state_from_other_session_rejected() {
        let client = client("https://authority.example");
        let mut s1 = Session::new("s1");
        let mut s2 = Session::new("s2");
        client.authorization_url(&mut s1, "https://h/").unwrap();
        client.authorization_url(&mut s2, "https://h/").unwrap();
        let s2_state = s2.oauth2_state.clone().unwrap();

        assert!(matches!(
            OAuth2Client::verify_state(&mut s1, &s2_state),
            Err(OAuth2Error::StateMismatch)
        ));
        // The pending state is consumed by the failed attempt
        assert!(matches!(
            OAuth2Client::verify_state(&mut s1, "anything"),
            Err(OAuth2Error::MissingState)
        ));
        assert!(OAuth2Client::verify_state(&mut s2, &s2_state).is_ok());
    }

    #[tokio::test]
    async fn test_complete_authorization_stores_token() {
        let base = spawn_stub(|req: Request<Incoming>| {
            if req.uri().path() == TOKEN_PATH {
                json(
                    StatusCode::OK,
                    r#"{"access_token":"user-token","token_type":"bearer","refresh_token":"r"}"#,
                )
            } else {
                json(StatusCode::NOT_FOUND, "{}")
            }
        })
        .await;
        let client = client(&base);

        let mut session = Session::new("s1");
        client.authorization_url(&mut session, "https://h/").unwrap();
        let state = session.oauth2_state.clone().unwrap();
        client
            .complete_authorization(&mut session, "code-1", &state, "https://h/")
            .await
            .unwrap();
        assert_eq!(session.access_token.as_deref(), Some("user-token"));
        assert!(session.oauth2_state.is_none());
    }

    #[tokio::test]
    async fn test_exchange_error_stores_nothing() {
        let base = spawn_stub(|_req: Request<Incoming>| {
            json(StatusCode::OK, r#"{"error":"bad_verification_code"}"#)
        })
        .await;
        let client = client(&base);

        let mut session = Session::new("s1");
        client.authorization_url(&mut session, "https://h/").unwrap();
        let state = session.oauth2_state.clone().unwrap();
        let result = client
            .complete_authorization(&mut session, "stale", &state, "https://h/")
            .await;
        assert!(matches!(result, Err(OAuth2Error::Exchange(_))));
        assert!(session.access_token.is_none());
    }

    #[tokio::test]
    async fn test_request_credentials() {
        let base = spawn_stub(|req: Request<Incoming>| {
            let query = req.uri().query().unwrap_or("").to_string();
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            json(
                StatusCode::OK,
                &serde_json::json!({ "query": query, "auth": auth }).to_string(),
            )
        })
        .await;
        let client = client(&base);

        let service = client
            .request(ApiRequest::get("/api/hosts/h1", Credentials::Service))
            .await
            .unwrap();
        let body: serde_json::Value = service.json().unwrap();
        assert_eq!(
            body["query"],
            "client_id=host-client&client_secret=host-secret"
        );
        assert_eq!(body["auth"], "");

        let user = client
            .request(ApiRequest::get("/api/user", Credentials::Token("abc")))
            .await
            .unwrap();
        let body: serde_json::Value = user.json().unwrap();
        assert_eq!(body["auth"], "token abc");
        assert_eq!(body["query"], "");
    }

    #[tokio::test]
    async fn test_unreachable_authority() {
        let client = client("http://127.0.0.1:1");
        let result = client
            .request(ApiRequest::get("/api/hosts/h1", Credentials::Service))
            .await;
        assert!(matches!(result, Err(OAuth2Error::Unreachable(_))));
    }
}
