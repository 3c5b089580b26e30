//! Front door server
//!
//! HTTPS (or plain HTTP when forced) listener in front of the proxy.

pub mod http;
pub mod response;
pub mod tls;

pub use http::{handle_request, run, AppState};
