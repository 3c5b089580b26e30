//! Heuristics for ambiguous requests
//!
//! A heuristic is registered for a container port and judges whether a
//! request without an explicit target is likely meant for a service on that
//! port.

use hyper::http::request::Parts;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProxySettings;

/// Verdict of a heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Likelihood {
    Likely,
    Unlikely,
    Unknown,
}

impl Likelihood {
    pub fn score(self) -> i32 {
        match self {
            Likelihood::Likely => 1,
            Likelihood::Unlikely => -1,
            Likelihood::Unknown => 0,
        }
    }
}

impl From<Option<bool>> for Likelihood {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Likelihood::Likely,
            Some(false) => Likelihood::Unlikely,
            None => Likelihood::Unknown,
        }
    }
}

/// Strategy judging a request for one port
pub trait ProxyHeuristic: Send + Sync {
    fn evaluate(&self, request: &Parts) -> Likelihood;
}

impl<F> ProxyHeuristic for F
where
    F: Fn(&Parts) -> Likelihood + Send + Sync,
{
    fn evaluate(&self, request: &Parts) -> Likelihood {
        self(request)
    }
}

/// Likely when the path starts with one of the prefixes
#[derive(Debug, Clone)]
pub struct PathPrefixHeuristic {
    prefixes: Vec<String>,
}

impl PathPrefixHeuristic {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl ProxyHeuristic for PathPrefixHeuristic {
    fn evaluate(&self, request: &Parts) -> Likelihood {
        let path = request.uri.path();
        if self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            Likelihood::Likely
        } else {
            Likelihood::Unknown
        }
    }
}

/// Port -> heuristic
#[derive(Clone, Default)]
pub struct HeuristicRegistry {
    by_port: HashMap<u16, Arc<dyn ProxyHeuristic>>,
}

impl HeuristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`PathPrefixHeuristic`] per configured port
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let mut registry = Self::new();
        for (port, prefixes) in &settings.heuristics {
            registry.register(*port, PathPrefixHeuristic::new(prefixes.iter().cloned()));
        }
        registry
    }

    pub fn register(&mut self, port: u16, heuristic: impl ProxyHeuristic + 'static) {
        self.by_port.insert(port, Arc::new(heuristic));
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    /// Score of `request` for `port`; ports without a heuristic score 0
    pub fn score(&self, port: u16, request: &Parts) -> i32 {
        self.by_port
            .get(&port)
            .map(|heuristic| heuristic.evaluate(request).score())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for HeuristicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ports: Vec<_> = self.by_port.keys().collect();
        ports.sort();
        f.debug_struct("HeuristicRegistry").field("ports", &ports).finish()
    }
}
