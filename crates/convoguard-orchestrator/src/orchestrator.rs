use crate::engine::DecisionEngine;
use crate::locks::KeyLocks;
use crate::retry::{is_retryable, with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use convoguard_channels::{BreakerSnapshot, DeliveryStatus, FlushReport, OutboundDispatcher};
use convoguard_compliance::{
    sweep_audit, AuditEventType, AuditLog, AuditRecord, AuditStore, DeletionRegistry,
    DeletionRequest, RetentionCategory, RetentionPolicy, SweepReport,
};
use convoguard_core::{ConvoError, ConvoResult, InboundEvent, OutboundMessage, SessionKey, SessionState};
use convoguard_security::RateLimiter;
use convoguard_session::{EncryptedSessionStore, StateCache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Store access tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on a single store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry policy for unavailable-store failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

/// Shared components the orchestrator works with, built once at startup.
pub struct ConvoContext {
    /// Per-sender admission control.
    pub limiter: Arc<RateLimiter>,
    /// Hot session states.
    pub cache: Arc<StateCache>,
    /// Durable, encrypted session states.
    pub store: Arc<EncryptedSessionStore>,
    /// Fire-and-forget audit writer.
    pub audit: Arc<AuditLog>,
    /// Audit storage, for retention sweeps.
    pub audit_store: Arc<dyn AuditStore>,
    /// Breaker-guarded reply delivery.
    pub outbound: Arc<OutboundDispatcher>,
    /// Erasure requests.
    pub deletions: Arc<DeletionRegistry>,
    /// Retention windows.
    pub retention: RetentionPolicy,
}

/// Result of handling one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// The sender is over its limit; nothing was touched.
    RateLimited,
    /// The state was advanced and persisted.
    Processed {
        /// Version now stored.
        version: u64,
        /// What happened to the reply, if one was produced.
        delivery: Option<DeliveryStatus>,
    },
}

/// Operational snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Outbound circuit.
    pub breaker: BreakerSnapshot,
    /// Replies parked for redelivery.
    pub outbound_queued: usize,
    /// Sessions in the cache.
    pub cached_sessions: usize,
    /// Senders tracked by the rate limiter.
    pub tracked_senders: usize,
    /// Erasure requests not yet finished; `None` when the ledger is unreadable.
    pub open_deletions: Option<usize>,
}

/// Runs inbound events through admission, state handling, audit and reply.
///
/// At most one event per conversation is in flight at a time; events for
/// different conversations run concurrently.
pub struct SessionOrchestrator {
    ctx: ConvoContext,
    engine: Arc<dyn DecisionEngine>,
    locks: KeyLocks,
    store_timeout: Duration,
    retry: RetryPolicy,
}

impl SessionOrchestrator {
    /// Create an orchestrator over `ctx`, deferring conversation logic to `engine`.
    pub fn new(ctx: ConvoContext, engine: Arc<dyn DecisionEngine>, config: &OrchestratorConfig) -> Self {
        Self {
            ctx,
            engine,
            locks: KeyLocks::new(),
            store_timeout: Duration::from_millis(config.timeout_ms),
            retry: config.retry.clone(),
        }
    }

    /// The shared components.
    pub fn context(&self) -> &ConvoContext {
        &self.ctx
    }

    /// Handle one inbound event end to end.
    ///
    /// The reply is sent only after the new state is durable; a failed send
    /// never rolls the state back. Dropping the returned future releases the
    /// conversation lock.
    pub async fn handle_event(&self, event: InboundEvent) -> ConvoResult<EventOutcome> {
        if !self.ctx.limiter.admit(&event.sender_id).await.is_allowed() {
            debug!(conversation = %event.conversation_id, "Event rate limited");
            return Ok(EventOutcome::RateLimited);
        }

        let key = event.session_key();
        let _guard = self.locks.lock(&key).await;

        let current = match self.load_for_update(&key).await {
            Ok(state) => state,
            Err(e) => return Err(self.degrade(&event, e).await),
        };

        let decision = self.engine.decide(&current, &event).await?;
        let changed = decision.payload != current.payload;
        let next = current.advance(decision.payload);

        // Store first: the cache must never hold a state the store lacks.
        if let Err(e) = self.persist(&next).await {
            return Err(self.degrade(&event, e).await);
        }
        if let Some(evicted) = self.ctx.cache.put(next.clone()) {
            debug!(session = %evicted, "Evicted from state cache");
        }

        let events = if decision.audit.is_empty() {
            vec![if changed {
                AuditEventType::DataModified
            } else {
                AuditEventType::DataAccessed
            }]
        } else {
            decision.audit
        };
        for event_type in events {
            self.ctx.audit.append(
                AuditRecord::new(
                    key.clone(),
                    event_type,
                    serde_json::json!({ "actor": "conversation", "version": next.version }),
                )
                .in_category(decision.category),
            );
        }

        let delivery = match decision.reply {
            Some(text) => Some(
                self.ctx
                    .outbound
                    .dispatch(OutboundMessage::new(event.sender_id.clone(), text))
                    .await,
            ),
            None => None,
        };

        debug!(session = %key, version = next.version, ?delivery, "Event processed");
        Ok(EventOutcome::Processed {
            version: next.version,
            delivery,
        })
    }

    /// Read a session on behalf of a human operator. Audited as a data access.
    pub async fn inspect(&self, key: &SessionKey, operator: &str) -> ConvoResult<Option<SessionState>> {
        let _guard = self.locks.lock(key).await;
        let state = match self.ctx.cache.get(key) {
            Some(state) => Some(state),
            None => {
                let store = &self.ctx.store;
                let loaded = match with_retry(&self.retry, self.store_timeout, "session load", move || {
                    store.load(key)
                })
                .await
                {
                    Ok(loaded) => loaded,
                    Err(ConvoError::Decryption(reason)) => {
                        warn!(session = %key, operator, reason = %reason, "Stored session unreadable, reported as absent");
                        None
                    }
                    Err(e) => return Err(e),
                };
                if let Some(state) = &loaded {
                    self.ctx.cache.put(state.clone());
                }
                loaded
            }
        };
        if let Some(state) = &state {
            info!(session = %key, operator, "Operator read session");
            self.ctx.audit.append(AuditRecord::new(
                key.clone(),
                AuditEventType::DataAccessed,
                serde_json::json!({ "actor": "operator", "operator": operator, "version": state.version }),
            ));
        }
        Ok(state)
    }

    /// File an erasure request. A subject with an open request gets that one back.
    pub async fn request_deletion(&self, key: &SessionKey) -> ConvoResult<DeletionRequest> {
        let _guard = self.locks.lock(key).await;
        if let Some(open) = self.ctx.deletions.open_for(key).await? {
            return Ok(open);
        }
        let request = self.ctx.deletions.request(key).await?;
        self.ctx.audit.append(AuditRecord::new(
            key.clone(),
            AuditEventType::DeletionRequested,
            serde_json::json!({ "request_id": request.id, "grace_until": request.grace_until }),
        ));
        Ok(request)
    }

    /// Withdraw an erasure request during its grace period.
    pub async fn cancel_deletion(&self, id: Uuid) -> ConvoResult<DeletionRequest> {
        let request = self.ctx.deletions.cancel(id).await?;
        self.ctx.audit.append(AuditRecord::new(
            request.subject_key.clone(),
            AuditEventType::DeletionCancelled,
            serde_json::json!({ "request_id": request.id }),
        ));
        Ok(request)
    }

    /// Erase every subject whose grace period has ended. Returns how many
    /// erasures completed; failed ones are put back for the next run.
    pub async fn process_due_deletions(&self, now: DateTime<Utc>) -> usize {
        let due = match self.ctx.deletions.begin_due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Could not read due erasure requests");
                return 0;
            }
        };
        let mut completed = 0;
        for request in due {
            match self.erase(&request.subject_key).await {
                Ok(()) => {
                    if let Err(e) = self.ctx.deletions.complete(request.id).await {
                        warn!(request_id = %request.id, error = %e, "Could not mark erasure complete");
                        continue;
                    }
                    self.ctx.audit.append(AuditRecord::new(
                        request.subject_key.clone(),
                        AuditEventType::DeletionCompleted,
                        serde_json::json!({ "request_id": request.id }),
                    ));
                    completed += 1;
                }
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "Erasure failed, will retry");
                    if let Err(e) = self.ctx.deletions.release(request.id).await {
                        error!(request_id = %request.id, error = %e, "Could not requeue erasure");
                    }
                }
            }
        }
        if completed > 0 {
            info!(completed, "Processed due erasure requests");
        }
        completed
    }

    /// Purge expired audit records and inactive sessions.
    pub async fn run_retention_sweep(&self, now: DateTime<Utc>) -> ConvoResult<SweepReport> {
        let mut report = sweep_audit(self.ctx.audit_store.as_ref(), &self.ctx.retention, now).await?;

        let cutoff = self.ctx.retention.cutoff(RetentionCategory::SessionData, now);
        let store = &self.ctx.store;
        let candidates = with_retry(&self.retry, self.store_timeout, "session scan", move || {
            store.inactive_since(cutoff)
        })
        .await?;
        for key in candidates {
            // Recheck under the key lock: an event may have written since the scan.
            let _guard = self.locks.lock(&key).await;
            let candidate = &key;
            let removed = with_retry(&self.retry, self.store_timeout, "session purge", move || {
                store.delete_if_inactive(candidate, cutoff)
            })
            .await?;
            if removed {
                self.ctx.cache.remove(&key);
                report.sessions += 1;
            }
        }
        self.locks.prune();

        info!(
            audit_records = report.audit_records,
            sessions = report.sessions,
            "Retention sweep finished"
        );
        Ok(report)
    }

    /// Retry parked replies.
    pub async fn flush_outbound(&self) -> FlushReport {
        self.ctx.outbound.flush().await
    }

    /// Operational snapshot.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            breaker: self.ctx.outbound.breaker().snapshot(),
            outbound_queued: self.ctx.outbound.queued(),
            cached_sessions: self.ctx.cache.len(),
            tracked_senders: self.ctx.limiter.tracked().await,
            open_deletions: match self.ctx.deletions.open_count().await {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(error = %e, "Could not count open erasure requests");
                    None
                }
            },
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Current state for `key`: cache, then store, then a fresh state.
    async fn load_for_update(&self, key: &SessionKey) -> ConvoResult<SessionState> {
        if let Some(state) = self.ctx.cache.get(key) {
            return Ok(state);
        }
        let store = &self.ctx.store;
        match with_retry(&self.retry, self.store_timeout, "session load", move || store.load(key)).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Ok(SessionState::new(key.clone())),
            Err(ConvoError::Decryption(reason)) => {
                warn!(session = %key, reason = %reason, "Stored session unreadable, starting fresh");
                self.fresh_over_unreadable(key).await
            }
            Err(e) => Err(e),
        }
    }

    /// A fresh state positioned to overwrite an unreadable stored one.
    async fn fresh_over_unreadable(&self, key: &SessionKey) -> ConvoResult<SessionState> {
        let store = &self.ctx.store;
        let mut fresh = SessionState::new(key.clone());
        match with_retry(&self.retry, self.store_timeout, "session version", move || {
            store.stored_version(key)
        })
        .await
        {
            Ok(version) => fresh.version = version.unwrap_or(0),
            Err(ConvoError::Decryption(_)) => {
                error!(session = %key, "Session envelope is malformed, removing it");
                with_retry(&self.retry, self.store_timeout, "session delete", move || {
                    store.delete(key)
                })
                .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(fresh)
    }

    async fn persist(&self, state: &SessionState) -> ConvoResult<()> {
        let store = &self.ctx.store;
        match with_retry(&self.retry, self.store_timeout, "session save", move || store.save(state)).await {
            Err(ConvoError::Conflict(reason)) => {
                // A timed-out attempt may have landed before the retry.
                let stored = with_retry(&self.retry, self.store_timeout, "session version", move || {
                    store.stored_version(&state.key)
                })
                .await?;
                if stored == Some(state.version) {
                    debug!(session = %state.key, version = state.version, "Earlier save attempt landed");
                    Ok(())
                } else {
                    Err(ConvoError::Conflict(reason))
                }
            }
            other => other,
        }
    }

    async fn erase(&self, key: &SessionKey) -> ConvoResult<()> {
        let _guard = self.locks.lock(key).await;
        self.ctx.cache.remove(key);
        let store = &self.ctx.store;
        with_retry(&self.retry, self.store_timeout, "session delete", move || store.delete(key)).await?;
        info!(session = %key, "Subject data erased");
        Ok(())
    }

    /// Log a failed event and tell the engine when the store is the cause.
    async fn degrade(&self, event: &InboundEvent, error: ConvoError) -> ConvoError {
        match &error {
            ConvoError::Conflict(_) => {
                self.ctx.cache.remove(&event.session_key());
                warn!(conversation = %event.conversation_id, error = %error, "Session changed underneath, cache entry dropped");
            }
            e if is_retryable(e) => {
                error!(conversation = %event.conversation_id, error = %error, "Durable store unavailable, conversation degraded");
                if let Some(apology) = self.engine.on_degraded(event, &error).await {
                    self.ctx
                        .outbound
                        .dispatch(OutboundMessage::new(event.sender_id.clone(), apology))
                        .await;
                }
            }
            _ => {
                warn!(conversation = %event.conversation_id, error = %error, "Event failed");
            }
        }
        error
    }
}
