//! Authentication for the front door
//!
//! Provides:
//! - OAuth2 authorization-code flow against the central authority
//! - Authenticated service and user-delegated API calls
//! - Cookie-bound sessions holding state, token and proxy memory

pub mod oauth2;
pub mod session;

pub use oauth2::{
    ApiRequest, ApiResponse, Credentials, OAuth2Client, OAuth2Config, OAuth2Error, TokenResponse,
};
pub use session::{
    cookie_value, new_session_id, resolve_session, MemorySessionStore, Session, SessionStore,
};
