//! Proxy URL grammar
//!
//! `/<container>/<port>[/<path>]` where the container id is at least 16
//! lowercase hex digits and the port is decimal.

use std::fmt;

/// Minimum container id length
pub const MIN_CONTAINER_ID_LEN: usize = 16;

/// A (container, port) pair addressed by a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    pub container: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(container: impl Into<String>, port: u16) -> Self {
        Self {
            container: container.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.port)
    }
}

/// Result of matching a request target against the grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    /// Explicit target; `rest` is the residual path and query, always starting with `/`
    Explicit { target: ProxyTarget, rest: String },
    /// Target without a path; `location` is the same URL with a `/` inserted
    MissingSlash { target: ProxyTarget, location: String },
    NoMatch,
}

/// Path rejected by [`normalize_path`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafePath(pub String);

impl fmt::Display for UnsafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path does not start with '/': {}", self.0)
    }
}

fn is_container_id(segment: &str) -> bool {
    segment.len() >= MIN_CONTAINER_ID_LEN
        && segment.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn parse_port(segment: &str) -> Option<u16> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Match a request path-and-query against the proxy grammar
pub fn match_path(path_and_query: &str) -> PathMatch {
    let Some(after_root) = path_and_query.strip_prefix('/') else {
        return PathMatch::NoMatch;
    };

    let Some((container, after_container)) = after_root.split_once('/') else {
        return PathMatch::NoMatch;
    };
    if !is_container_id(container) {
        return PathMatch::NoMatch;
    }

    let port_end = after_container
        .find(['/', '?'])
        .unwrap_or(after_container.len());
    let (port, tail) = after_container.split_at(port_end);
    let Some(port) = parse_port(port) else {
        return PathMatch::NoMatch;
    };
    let target = ProxyTarget::new(container, port);

    if tail.starts_with('/') {
        PathMatch::Explicit {
            target,
            rest: tail.to_string(),
        }
    } else {
        // Empty path, possibly followed by a query string
        let prefix_len = path_and_query.len() - tail.len();
        PathMatch::MissingSlash {
            location: format!("{}/{}", &path_and_query[..prefix_len], tail),
            target,
        }
    }
}

/// Extract the target a `Referer` URL points at
pub fn parse_referer(referer: &str) -> Option<ProxyTarget> {
    let path = match referer.find("://") {
        Some(scheme_end) => {
            let after_scheme = &referer[scheme_end + 3..];
            &after_scheme[after_scheme.find('/')?..]
        }
        None => referer,
    };
    match match_path(path) {
        PathMatch::Explicit { target, .. } | PathMatch::MissingSlash { target, .. } => Some(target),
        PathMatch::NoMatch => None,
    }
}

/// Collapse `.` and `..` segments of a path, keeping the query untouched
pub fn normalize_path(path_and_query: &str) -> Result<String, UnsafePath> {
    if !path_and_query.starts_with('/') {
        return Err(UnsafePath(path_and_query.to_string()));
    }

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/').skip(1) {
        match segment {
            "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    // A trailing dot segment still addresses a directory
    if matches!(path.rsplit('/').next(), Some(".") | Some("..")) {
        segments.push("");
    }

    let mut normalized = format!("/{}", segments.join("/"));
    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
    }
    Ok(normalized)
}
