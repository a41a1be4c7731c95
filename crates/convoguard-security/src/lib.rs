//! Security primitives for ConvoGuard.
//!
//! Provides the per-sender rate limiter that guards state creation and the
//! authenticated encryption used for every session persisted to the durable
//! backend.
//!
//! # Main types
//!
//! - [`RateLimiter`] — Fixed-window per-sender limiter with a bounded bucket map.
//! - [`Keyring`] — Versioned AES-256-GCM keys; encrypts and decrypts [`EncryptedBlob`]s.
//! - [`EncryptionKey`] — A 256-bit key, resolved per [`Environment`] at startup.

/// Session encryption and key lifecycle.
pub mod crypto;
/// Fixed-window rate limiting.
pub mod rate_limit;

pub use crypto::{resolve_key, EncryptedBlob, EncryptionKey, Environment, Keyring};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
