//! hostgate - authenticated front door for cluster hosts
//!
//! A host joins the cluster and exposes its Docker containers to users
//! through one HTTPS/WebSocket front door.
//!
//! ## Components
//!
//! - **tls**: certificate validation and issuance (self-signed, CA-signed, ACME)
//! - **bootstrap**: staged boot - HTTP forwarder, HTTPS and cluster mutual-TLS
//!   certificates, registration with the central authority
//! - **auth**: OAuth2 client and cookie sessions
//! - **proxy**: `/<container>/<port>/...` routing with Referer and heuristic
//!   fallbacks, byte-transparent forwarding including WebSocket upgrades
//! - **server**: the front door listener tying sessions, OAuth2 and the proxy together

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod proxy;
pub mod server;
pub mod tls;
pub mod types;

pub use config::{Args, Settings, SettingsStore};
pub use server::{run, AppState};
pub use types::{GatewayError, Result};
