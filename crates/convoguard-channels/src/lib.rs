//! Outbound messaging for ConvoGuard.
//!
//! Every reply leaves the process through an [`OutboundDispatcher`], which
//! runs the send under a [`CircuitBreaker`] and parks replies that cannot be
//! delivered according to the configured [`UnavailablePolicy`].
//!
//! # Main types
//!
//! - [`OutboundChannel`] — Trait for a messaging platform's send API.
//! - [`CircuitBreaker`] — Three-state breaker guarding the send API.
//! - [`OutboundDispatcher`] — Breaker-guarded send with a bounded retry queue.
//! - [`WhatsAppChannel`] — WhatsApp Cloud API adapter.

/// Three-state circuit breaker.
pub mod breaker;
/// Core outbound channel trait.
pub mod channel;
/// Breaker-guarded dispatch and the outbound retry queue.
pub mod outbound;
/// WhatsApp Cloud API integration.
pub mod whatsapp;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitStatus};
pub use channel::OutboundChannel;
pub use outbound::{DeliveryStatus, FlushReport, OutboundConfig, OutboundDispatcher, UnavailablePolicy};
pub use whatsapp::{WhatsAppChannel, WhatsAppConfig};
