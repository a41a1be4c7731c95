use async_trait::async_trait;
use convoguard_compliance::{AuditEventType, RetentionCategory};
use convoguard_core::{ConvoError, ConvoResult, InboundEvent, SessionState};

/// What the conversational logic decided for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    /// The conversation's new opaque payload.
    pub payload: Vec<u8>,
    /// Text to send back to the sender, if any.
    pub reply: Option<String>,
    /// Privacy events this step produced (consent prompts, decisions).
    pub audit: Vec<AuditEventType>,
    /// Retention bucket for this step's audit records.
    pub category: RetentionCategory,
}

impl Decision {
    /// A decision storing `payload`, with no reply and no explicit events.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Keep the current payload unchanged.
    pub fn unchanged(state: &SessionState) -> Self {
        Self::new(state.payload.clone())
    }

    /// Reply to the sender with `reply`.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Record `event` in the audit trail.
    pub fn with_audit(mut self, event: AuditEventType) -> Self {
        self.audit.push(event);
        self
    }

    /// File this step's audit records under `category`.
    pub fn in_category(mut self, category: RetentionCategory) -> Self {
        self.category = category;
        self
    }
}

/// The conversational logic (permit flow, form filling) behind the orchestrator.
///
/// Implementations treat the payload as their own format; the orchestrator
/// never looks inside it.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Produce the next step for `state` given `event`.
    async fn decide(&self, state: &SessionState, event: &InboundEvent) -> ConvoResult<Decision>;

    /// Called when the durable store stays unavailable after retries.
    /// Returns an optional apology to send to the sender.
    async fn on_degraded(&self, _event: &InboundEvent, _error: &ConvoError) -> Option<String> {
        None
    }
}
