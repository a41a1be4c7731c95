use crate::state::SessionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized inbound event.
///
/// The messaging gateway verifies webhook signatures and normalizes the
/// provider payload before handing the event to ConvoGuard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Sender identity, also used as the rate-limit bucket.
    pub sender_id: String,
    /// Conversation the event belongs to.
    pub conversation_id: String,
    /// Provider-normalized message content.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the gateway received the event.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Creates an event received now.
    pub fn new(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            conversation_id: conversation_id.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// The session key for this event's conversation.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.conversation_id.clone())
    }
}

/// A reply submitted to the messaging gateway's send API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient identity on the messaging platform.
    pub recipient_id: String,
    /// Text content of the reply.
    pub content: String,
}

impl OutboundMessage {
    /// Creates a new outbound message.
    pub fn new(recipient_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            content: content.into(),
        }
    }
}
