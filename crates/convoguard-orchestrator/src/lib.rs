//! Conversation orchestration for ConvoGuard.
//!
//! Ties the rate limiter, state cache, encrypted store, audit log and
//! outbound dispatcher together for each inbound event, with updates to the
//! same conversation strictly serialized.
//!
//! # Main types
//!
//! - [`SessionOrchestrator`] — Runs one inbound event end to end.
//! - [`ConvoContext`] — Explicitly constructed shared components.
//! - [`DecisionEngine`] — The conversational logic plugged into the orchestrator.
//! - [`InboundDispatcher`] — Bounded queue feeding the orchestrator.
//! - [`KeyLocks`] — Per-conversation async mutual exclusion.

/// Decision engine seam.
pub mod engine;
/// Bounded inbound queue.
pub mod inbound;
/// Per-key locks.
pub mod locks;
/// The orchestrator itself.
pub mod orchestrator;
/// Bounded retry for store I/O.
pub mod retry;

pub use engine::{Decision, DecisionEngine};
pub use inbound::{InboundDispatcher, SubmitError};
pub use locks::{KeyGuard, KeyLocks};
pub use orchestrator::{
    ConvoContext, EventOutcome, HealthReport, OrchestratorConfig, SessionOrchestrator,
};
pub use retry::RetryPolicy;
