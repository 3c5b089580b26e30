//! Request routing to container ports
//!
//! Resolution order for the target of a request:
//! 1. Explicit `/<container>/<port>/...` prefix, which is stripped
//! 2. The same shape in the `Referer` header
//! 3. A heuristic guess from the session's memory (not for upgrades)
//!
//! Explicit and referer targets are remembered for later guesses.

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{HOST, REFERER};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::forward::{forward, is_upgrade_request, ForwardError};
use super::heuristics::HeuristicRegistry;
use super::memory::ProxyRequestMemory;
use super::ports::{PortLookupError, PortResolver, ProxyMode};
use super::route::{match_path, normalize_path, parse_referer, PathMatch, ProxyTarget};
use crate::server::response::{
    bad_request_response, error_response, not_found_response, redirect_response, BoxBody,
};

/// How a request's target was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Direct,
    Referer,
    Heuristic,
}

/// A request ready to be sent to its target
#[derive(Debug)]
pub struct ProxyRequest<B> {
    /// Request with the proxy prefix stripped from its URI
    pub request: Request<B>,
    pub target: ProxyTarget,
    pub via: ResolvedVia,
}

/// Outcome of [`ProxyRouter::route`]
#[derive(Debug)]
pub enum Routed<B> {
    Forward(ProxyRequest<B>),
    /// Answer directly without contacting any upstream
    Respond(Response<BoxBody>),
    /// Drop the connection without a response
    Close,
}

pub struct ProxyRouter {
    heuristics: HeuristicRegistry,
    ports: Arc<dyn PortResolver>,
}

impl ProxyRouter {
    pub fn new(heuristics: HeuristicRegistry, ports: Arc<dyn PortResolver>) -> Self {
        Self { heuristics, ports }
    }

    pub fn heuristics(&self) -> &HeuristicRegistry {
        &self.heuristics
    }

    /// Resolve the target of `req`, updating the session memory
    pub fn route<B>(&self, req: Request<B>, memory: &mut ProxyRequestMemory) -> Routed<B> {
        let upgrade = is_upgrade_request(&req);
        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (target, path, via) = match match_path(&path_and_query) {
            PathMatch::MissingSlash { location, .. } => {
                if upgrade {
                    debug!(path = %path_and_query, "Upgrade request without path, closing");
                    return Routed::Close;
                }
                return Routed::Respond(redirect_response(StatusCode::MOVED_PERMANENTLY, &location));
            }
            PathMatch::Explicit { target, rest } => {
                memory.remember(target.clone());
                (target, rest, ResolvedVia::Direct)
            }
            PathMatch::NoMatch => match self.resolve_implicit(&parts, memory, upgrade) {
                Some((target, via)) => (target, path_and_query, via),
                None => {
                    return Routed::Respond(bad_request_response(
                        "Unable to determine container and port for request",
                    ))
                }
            },
        };

        let path = match normalize_path(&path) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Rejected proxy path");
                return Routed::Respond(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Invalid proxy path",
                ));
            }
        };
        parts.uri = match path.parse::<Uri>() {
            Ok(uri) => uri,
            Err(_) => return Routed::Respond(bad_request_response("Invalid request path")),
        };

        debug!(proxy_target = %target, ?via, path = %parts.uri, "Resolved proxy target");
        Routed::Forward(ProxyRequest {
            request: Request::from_parts(parts, body),
            target,
            via,
        })
    }

    fn resolve_implicit(
        &self,
        parts: &Parts,
        memory: &mut ProxyRequestMemory,
        upgrade: bool,
    ) -> Option<(ProxyTarget, ResolvedVia)> {
        let from_referer = parts
            .headers
            .get(REFERER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_referer);
        if let Some(target) = from_referer {
            memory.remember(target.clone());
            return Some((target, ResolvedVia::Referer));
        }

        if upgrade {
            return None;
        }
        memory
            .guess(parts, &self.heuristics)
            .map(|target| (target, ResolvedVia::Heuristic))
    }

    /// Look up the target's host port and forward or redirect accordingly
    pub async fn forward<B>(&self, proxied: ProxyRequest<B>, access_token: &str) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let ProxyRequest { request, target, .. } = proxied;

        let mapping = match self.ports.resolve(access_token, &target).await {
            Ok(mapping) => mapping,
            Err(PortLookupError::NotFound(_)) => {
                return not_found_response(&format!("Unknown container port {}", target))
            }
            Err(PortLookupError::Unavailable(e)) => {
                warn!(proxy_target = %target, error = %e, "Port lookup unavailable");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "Port lookup unavailable");
            }
            Err(PortLookupError::Other(e)) => {
                warn!(proxy_target = %target, error = %e, "Port lookup failed");
                return error_response(StatusCode::BAD_GATEWAY, "Port lookup failed");
            }
        };

        match mapping.proxy_mode {
            ProxyMode::Https => {
                info!(
                    proxy_target = %target,
                    host_port = mapping.host_port,
                    method = %request.method(),
                    path = %request.uri(),
                    "Proxying request"
                );
                match forward(request, mapping.host_port).await {
                    Ok(response) => response,
                    Err(e @ ForwardError::Connect { .. }) => {
                        warn!(proxy_target = %target, error = %e, "Upstream unreachable");
                        error_response(StatusCode::SERVICE_UNAVAILABLE, "Container unreachable")
                    }
                    Err(e) => {
                        warn!(proxy_target = %target, error = %e, "Upstream request failed");
                        error_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
                    }
                }
            }
            ProxyMode::None => {
                let Some(host) = request_hostname(&request) else {
                    return bad_request_response("Missing Host header");
                };
                let path = request
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                let location = format!("http://{}:{}{}", host, mapping.host_port, path);
                debug!(proxy_target = %target, location = %location, "Redirecting to published port");
                redirect_response(StatusCode::FOUND, &location)
            }
            ProxyMode::Unknown(mode) => {
                warn!(proxy_target = %target, mode = %mode, "Unknown proxy mode");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unknown proxy mode")
            }
        }
    }
}

/// Host header without its port
fn request_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req.headers().get(HOST)?.to_str().ok()?;
    let hostname = match host.rsplit_once(':') {
        // Bracketed IPv6 literal without a port
        Some((_, port)) if port.ends_with(']') => host,
        Some((hostname, _)) => hostname,
        None => host,
    };
    (!hostname.is_empty()).then(|| hostname.to_string())
}
