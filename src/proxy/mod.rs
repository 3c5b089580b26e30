//! Reverse proxy to container ports
//!
//! Requests address a container port as `/<container>/<port>/<path>`, or
//! implicitly through their `Referer` or the session's recent history. The
//! authority maps the pair to a host port, then bytes are relayed to it,
//! WebSocket upgrades included.

pub mod forward;
pub mod heuristics;
pub mod memory;
pub mod ports;
pub mod route;
pub mod router;

pub use forward::{forward, is_upgrade_request, ForwardError};
pub use heuristics::{HeuristicRegistry, Likelihood, PathPrefixHeuristic, ProxyHeuristic};
pub use memory::{ProxyRequestMemory, PROXY_MEMORY_CAPACITY};
pub use ports::{AuthorityPortResolver, PortLookupError, PortMapping, PortResolver, ProxyMode};
pub use route::{match_path, normalize_path, parse_referer, PathMatch, ProxyTarget};
pub use router::{ProxyRequest, ProxyRouter, ResolvedVia, Routed};
