//! Core types and error definitions for ConvoGuard.
//!
//! This crate provides the foundational types shared across all ConvoGuard
//! crates: the unified error enum, conversation keys, session state and the
//! normalized inbound/outbound message shapes exchanged with the messaging
//! gateway.
//!
//! # Main types
//!
//! - [`ConvoError`] — Unified error enum for all ConvoGuard subsystems.
//! - [`ConvoResult`] — Convenience alias for `Result<T, ConvoError>`.
//! - [`SessionKey`] — Opaque conversation identifier.
//! - [`SessionState`] — Versioned, opaque per-conversation state.
//! - [`InboundEvent`] — A normalized event delivered by the messaging gateway.
//! - [`OutboundMessage`] — A reply to be sent through the messaging gateway.

/// Inbound and outbound message shapes.
pub mod event;
/// Session keys and session state.
pub mod state;

pub use event::{InboundEvent, OutboundMessage};
pub use state::{SessionKey, SessionState};

// --- Error types ---

/// Top-level error type for ConvoGuard.
///
/// Each variant corresponds to a failure class with its own handling policy.
/// Rate limiting is deliberately absent: a denied sender is a normal outcome.
#[derive(Debug, thiserror::Error)]
pub enum ConvoError {
    /// A stored session could not be decrypted or authenticated.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The outbound messaging API is unavailable (circuit open or send failed).
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The durable session backend failed or timed out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The audit store rejected or failed to persist a record.
    #[error("Audit write failure: {0}")]
    AuditWrite(String),

    /// A session write lost an optimistic-consistency check.
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Invalid or missing configuration. Fatal at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound channel adapter.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An error related to session lookup or lifecycle.
    #[error("Session error: {0}")]
    Session(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvoError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConvoError::StoreUnavailable(_)
                | ConvoError::UpstreamUnavailable(_)
                | ConvoError::AuditWrite(_)
                | ConvoError::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`ConvoError`].
pub type ConvoResult<T> = Result<T, ConvoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ConvoError::StoreUnavailable("timeout".into()).is_transient());
        assert!(ConvoError::UpstreamUnavailable("open".into()).is_transient());
        assert!(!ConvoError::Decryption("tag".into()).is_transient());
        assert!(!ConvoError::Config("missing key".into()).is_transient());
        assert!(!ConvoError::Conflict("stale".into()).is_transient());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = ConvoError::StoreUnavailable("redis timeout".into());
        assert_eq!(err.to_string(), "Store unavailable: redis timeout");
    }
}
