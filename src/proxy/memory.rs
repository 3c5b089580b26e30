//! Per-session memory of explicit proxy targets

use hyper::http::request::Parts;
use std::collections::VecDeque;
use tracing::warn;

use super::heuristics::HeuristicRegistry;
use super::route::ProxyTarget;

/// Targets remembered per session
pub const PROXY_MEMORY_CAPACITY: usize = 20;

/// Recently addressed targets, most recent first, unique by (container, port)
#[derive(Debug, Clone, Default)]
pub struct ProxyRequestMemory {
    entries: VecDeque<ProxyTarget>,
}

impl ProxyRequestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `target` to the front, evicting the oldest entry when full
    pub fn remember(&mut self, target: ProxyTarget) {
        if let Some(index) = self.entries.iter().position(|entry| *entry == target) {
            self.entries.remove(index);
        }
        self.entries.push_front(target);
        self.entries.truncate(PROXY_MEMORY_CAPACITY);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProxyTarget> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best remembered target for a request without an explicit one
    ///
    /// Ties go to the most recent entry. A negative best score means every
    /// candidate was judged unlikely and nothing is returned.
    pub fn guess(&self, request: &Parts, heuristics: &HeuristicRegistry) -> Option<ProxyTarget> {
        let mut best: Option<(&ProxyTarget, i32)> = None;
        for entry in &self.entries {
            let score = heuristics.score(entry.port, request);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((entry, score));
            }
        }

        let (target, score) = best?;
        if score < 0 {
            return None;
        }
        if score == 0 {
            warn!(
                path = %request.uri.path(),
                proxy_target = %target,
                "No heuristic could place request, guessing most recent target"
            );
        }
        Some(target.clone())
    }
}
