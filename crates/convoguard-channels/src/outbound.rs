use crate::breaker::CircuitBreaker;
use crate::channel::OutboundChannel;
use convoguard_core::OutboundMessage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with a reply that cannot be delivered right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Keep it in a bounded queue and retry on the next flush.
    #[default]
    Queue,
    /// Discard it.
    Drop,
}

/// Outbound delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundConfig {
    /// Handling of replies the upstream cannot take.
    #[serde(default)]
    pub on_unavailable: UnavailablePolicy,
    /// Maximum number of parked replies.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            on_unavailable: UnavailablePolicy::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_000
}

/// Result of dispatching one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivered to the upstream.
    Sent,
    /// Parked for a later flush.
    Queued,
    /// Discarded.
    Dropped,
}

/// Result of a queue flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Replies delivered during the flush.
    pub sent: usize,
    /// Replies discarded because the upstream rejected them outright.
    pub rejected: usize,
    /// Replies still parked afterwards.
    pub remaining: usize,
}

/// Sends replies through a circuit breaker and parks the ones that fail.
///
/// Delivery problems never propagate to the caller: by the time a reply is
/// dispatched the conversation state is already durable.
pub struct OutboundDispatcher {
    channel: Arc<dyn OutboundChannel>,
    breaker: Arc<CircuitBreaker>,
    policy: UnavailablePolicy,
    queue_capacity: usize,
    queue: Mutex<VecDeque<OutboundMessage>>,
}

impl OutboundDispatcher {
    /// Create a dispatcher for `channel` guarded by `breaker`.
    pub fn new(
        channel: Arc<dyn OutboundChannel>,
        breaker: Arc<CircuitBreaker>,
        config: &OutboundConfig,
    ) -> Self {
        Self {
            channel,
            breaker,
            policy: config.on_unavailable,
            queue_capacity: config.queue_capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Send one reply.
    pub async fn dispatch(&self, message: OutboundMessage) -> DeliveryStatus {
        match self.breaker.call(self.channel.send(&message)).await {
            Ok(()) => {
                debug!(channel = self.channel.name(), "Reply sent");
                DeliveryStatus::Sent
            }
            Err(e) if e.is_transient() => {
                warn!(channel = self.channel.name(), error = %e, "Reply not delivered");
                self.park(message)
            }
            Err(e) => {
                warn!(channel = self.channel.name(), error = %e, "Reply rejected by upstream");
                DeliveryStatus::Dropped
            }
        }
    }

    /// Retry parked replies in order, stopping at the first transient failure.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            let Some(message) = self.queue.lock().pop_front() else {
                break;
            };
            match self.breaker.call(self.channel.send(&message)).await {
                Ok(()) => report.sent += 1,
                Err(e) if e.is_transient() => {
                    self.queue.lock().push_front(message);
                    break;
                }
                Err(e) => {
                    warn!(channel = self.channel.name(), error = %e, "Parked reply rejected, discarding");
                    report.rejected += 1;
                }
            }
        }
        report.remaining = self.queued();
        if report.sent > 0 {
            info!(sent = report.sent, remaining = report.remaining, "Flushed outbound queue");
        }
        report
    }

    /// Number of parked replies.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// The breaker guarding this dispatcher.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn park(&self, message: OutboundMessage) -> DeliveryStatus {
        match self.policy {
            UnavailablePolicy::Drop => DeliveryStatus::Dropped,
            UnavailablePolicy::Queue => {
                let mut queue = self.queue.lock();
                if queue.len() >= self.queue_capacity {
                    queue.pop_front();
                    warn!(capacity = self.queue_capacity, "Outbound queue full, discarded oldest reply");
                }
                queue.push_back(message);
                DeliveryStatus::Queued
            }
        }
    }
}
