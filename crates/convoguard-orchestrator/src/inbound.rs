use crate::orchestrator::{EventOutcome, SessionOrchestrator};
use convoguard_core::InboundEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Why an event was not accepted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is full; the caller should shed load.
    #[error("inbound queue is full")]
    Full,
    /// The dispatcher has shut down.
    #[error("inbound dispatcher is closed")]
    Closed,
}

/// Bounded queue between event delivery and the orchestrator.
///
/// A full queue is reported to the submitter instead of buffering without
/// limit. Events are processed concurrently, up to `max_in_flight` at once;
/// the orchestrator serializes events of the same conversation.
#[derive(Clone)]
pub struct InboundDispatcher {
    tx: mpsc::Sender<InboundEvent>,
}

impl InboundDispatcher {
    /// Start the dispatch loop.
    ///
    /// The loop ends once every clone of the returned dispatcher is dropped
    /// and the events already accepted have been handled, so awaiting the
    /// handle drains the queue on shutdown.
    pub fn spawn(
        orchestrator: Arc<SessionOrchestrator>,
        queue_capacity: usize,
        max_in_flight: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<InboundEvent>(queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break;
                        };
                        let orchestrator = orchestrator.clone();
                        in_flight.spawn(async move {
                            handle_one(&orchestrator, event).await;
                            drop(permit);
                        });
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "Inbound event task failed");
                        }
                    }
                    else => break,
                }
            }
            debug!("Inbound dispatcher stopped");
        });

        (Self { tx }, handle)
    }

    /// Enqueue an event without waiting.
    pub fn try_submit(&self, event: InboundEvent) -> Result<(), SubmitError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Events waiting in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

async fn handle_one(orchestrator: &SessionOrchestrator, event: InboundEvent) {
    let conversation = event.conversation_id.clone();
    match orchestrator.handle_event(event).await {
        Ok(EventOutcome::RateLimited) => {
            debug!(conversation = %conversation, "Inbound event rate limited");
        }
        Ok(EventOutcome::Processed { version, .. }) => {
            debug!(conversation = %conversation, version, "Inbound event processed");
        }
        Err(e) => {
            warn!(conversation = %conversation, error = %e, "Inbound event failed");
        }
    }
}
