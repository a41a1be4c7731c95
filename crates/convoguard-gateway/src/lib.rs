//! HTTP ingress for ConvoGuard.
//!
//! The messaging gateway posts normalized, signature-verified events to
//! `POST /v1/events`; operators use the session and deletion endpoints.
//! `GET /health` is always unauthenticated.

/// Bearer-key authentication.
pub mod middleware;
/// Router and handlers.
pub mod server;

pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
