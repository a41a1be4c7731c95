use async_trait::async_trait;
use convoguard_core::{ConvoResult, OutboundMessage};

/// A messaging platform's send API.
///
/// Implementations report platform outages and throttling as
/// [`convoguard_core::ConvoError::UpstreamUnavailable`] so the circuit breaker
/// counts them; request-specific rejections use
/// [`convoguard_core::ConvoError::Channel`].
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Channel name, used in logs and health output.
    fn name(&self) -> &str;
    /// Deliver one message.
    async fn send(&self, message: &OutboundMessage) -> ConvoResult<()>;
}
