use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use convoguard_core::{ConvoError, ConvoResult, SessionKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle of an erasure request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    /// Waiting out the grace period; can still be cancelled.
    Requested,
    /// Erasure is running.
    Processing,
    /// Data is gone.
    Completed,
    /// Withdrawn by the subject.
    Cancelled,
}

impl DeletionStatus {
    /// Whether the request still blocks a new one for the same subject.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Requested | Self::Processing)
    }

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Inverse of [`DeletionStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A right-to-erasure request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRequest {
    /// Request identifier handed back to the subject.
    pub id: Uuid,
    /// Conversation whose data is to be erased.
    pub subject_key: SessionKey,
    /// Where the request is in its lifecycle.
    pub status: DeletionStatus,
    /// When the request was filed.
    pub requested_at: DateTime<Utc>,
    /// Earliest moment processing may start.
    pub grace_until: DateTime<Utc>,
    /// When erasure finished.
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Ledger ──────────────────────────────────────────────────────────────────

/// Durable home of open erasure requests.
///
/// Requests that reach a final state are removed; the audit trail keeps the
/// record of what happened.
#[async_trait]
pub trait DeletionLedger: Send + Sync {
    /// Insert or replace `request`.
    async fn put(&self, request: &DeletionRequest) -> ConvoResult<()>;

    /// Look a request up by id.
    async fn get(&self, id: Uuid) -> ConvoResult<Option<DeletionRequest>>;

    /// The open request for `subject`, if any.
    async fn open_for(&self, subject: &SessionKey) -> ConvoResult<Option<DeletionRequest>>;

    /// Requests in `status`, oldest first.
    async fn in_status(&self, status: DeletionStatus) -> ConvoResult<Vec<DeletionRequest>>;

    /// Requested entries whose grace period has ended by `now`.
    async fn due(&self, now: DateTime<Utc>) -> ConvoResult<Vec<DeletionRequest>>;

    /// Drop a request. Returns whether it existed.
    async fn remove(&self, id: Uuid) -> ConvoResult<bool>;

    /// Number of requests held. All of them are open.
    async fn open_count(&self) -> ConvoResult<usize>;
}

/// Ledger kept in process memory, for tests and single-run tools.
#[derive(Default)]
pub struct InMemoryDeletionLedger {
    requests: RwLock<HashMap<Uuid, DeletionRequest>>,
}

impl InMemoryDeletionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeletionLedger for InMemoryDeletionLedger {
    async fn put(&self, request: &DeletionRequest) -> ConvoResult<()> {
        self.requests.write().insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ConvoResult<Option<DeletionRequest>> {
        Ok(self.requests.read().get(&id).cloned())
    }

    async fn open_for(&self, subject: &SessionKey) -> ConvoResult<Option<DeletionRequest>> {
        Ok(self
            .requests
            .read()
            .values()
            .find(|r| r.subject_key == *subject && r.status.is_open())
            .cloned())
    }

    async fn in_status(&self, status: DeletionStatus) -> ConvoResult<Vec<DeletionRequest>> {
        let mut found: Vec<DeletionRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.requested_at);
        Ok(found)
    }

    async fn due(&self, now: DateTime<Utc>) -> ConvoResult<Vec<DeletionRequest>> {
        let mut due = self.in_status(DeletionStatus::Requested).await?;
        due.retain(|r| r.grace_until <= now);
        Ok(due)
    }

    async fn remove(&self, id: Uuid) -> ConvoResult<bool> {
        Ok(self.requests.write().remove(&id).is_some())
    }

    async fn open_count(&self) -> ConvoResult<usize> {
        Ok(self.requests.read().len())
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Erasure workflow over a [`DeletionLedger`]:
/// requested → processing → completed, cancellable while requested.
pub struct DeletionRegistry {
    ledger: Arc<dyn DeletionLedger>,
    grace: Duration,
    transitions: Mutex<()>,
}

impl DeletionRegistry {
    /// Registry persisting to `ledger`, holding requests for `grace` before
    /// they become due.
    pub fn new(ledger: Arc<dyn DeletionLedger>, grace: Duration) -> Self {
        Self {
            ledger,
            grace,
            transitions: Mutex::new(()),
        }
    }

    /// Registry over a fresh [`InMemoryDeletionLedger`].
    pub fn in_memory(grace: Duration) -> Self {
        Self::new(Arc::new(InMemoryDeletionLedger::new()), grace)
    }

    /// File a request for `subject`. Returns the already-open request if
    /// there is one.
    pub async fn request(&self, subject: &SessionKey) -> ConvoResult<DeletionRequest> {
        self.request_at(subject, Utc::now()).await
    }

    /// [`DeletionRegistry::request`] with an explicit clock.
    pub async fn request_at(&self, subject: &SessionKey, now: DateTime<Utc>) -> ConvoResult<DeletionRequest> {
        let _serial = self.transitions.lock().await;
        if let Some(open) = self.ledger.open_for(subject).await? {
            return Ok(open);
        }
        let grace_until = now
            .checked_add_signed(self.grace)
            .ok_or_else(|| ConvoError::Config("deletion grace period is out of range".into()))?;
        let request = DeletionRequest {
            id: Uuid::new_v4(),
            subject_key: subject.clone(),
            status: DeletionStatus::Requested,
            requested_at: now,
            grace_until,
            completed_at: None,
        };
        self.ledger.put(&request).await?;
        info!(request_id = %request.id, grace_until = %request.grace_until, "Erasure requested");
        Ok(request)
    }

    /// Withdraw a request still in its grace period.
    pub async fn cancel(&self, id: Uuid) -> ConvoResult<DeletionRequest> {
        self.transition(id, DeletionStatus::Requested, DeletionStatus::Cancelled)
            .await
    }

    /// Move every request whose grace period has ended to processing and
    /// return them.
    pub async fn begin_due(&self, now: DateTime<Utc>) -> ConvoResult<Vec<DeletionRequest>> {
        let _serial = self.transitions.lock().await;
        let mut started = Vec::new();
        for mut request in self.ledger.due(now).await? {
            request.status = DeletionStatus::Processing;
            self.ledger.put(&request).await?;
            started.push(request);
        }
        Ok(started)
    }

    /// Mark a processing request as done.
    pub async fn complete(&self, id: Uuid) -> ConvoResult<DeletionRequest> {
        self.transition(id, DeletionStatus::Processing, DeletionStatus::Completed)
            .await
    }

    /// Put a processing request back so the next run picks it up again.
    pub async fn release(&self, id: Uuid) -> ConvoResult<DeletionRequest> {
        self.transition(id, DeletionStatus::Processing, DeletionStatus::Requested)
            .await
    }

    /// Return requests left in processing by a previous run to requested.
    /// Call once at startup, before the first [`DeletionRegistry::begin_due`].
    pub async fn resume_interrupted(&self) -> ConvoResult<usize> {
        let _serial = self.transitions.lock().await;
        let mut resumed = 0;
        for mut request in self.ledger.in_status(DeletionStatus::Processing).await? {
            request.status = DeletionStatus::Requested;
            self.ledger.put(&request).await?;
            resumed += 1;
        }
        if resumed > 0 {
            warn!(resumed, "Erasures interrupted by a restart were requeued");
        }
        Ok(resumed)
    }

    /// Look a request up while it is still open.
    pub async fn get(&self, id: Uuid) -> ConvoResult<Option<DeletionRequest>> {
        self.ledger.get(id).await
    }

    /// The open request for `subject`, if any.
    pub async fn open_for(&self, subject: &SessionKey) -> ConvoResult<Option<DeletionRequest>> {
        self.ledger.open_for(subject).await
    }

    /// Requests not yet completed or cancelled.
    pub async fn open_count(&self) -> ConvoResult<usize> {
        self.ledger.open_count().await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: DeletionStatus,
        to: DeletionStatus,
    ) -> ConvoResult<DeletionRequest> {
        let _serial = self.transitions.lock().await;
        let mut request = self
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| ConvoError::Session(format!("no open erasure request {id}")))?;
        if request.status != from {
            return Err(ConvoError::Session(format!(
                "erasure request {id} is {:?}, expected {:?}",
                request.status, from
            )));
        }
        request.status = to;
        if to == DeletionStatus::Completed {
            request.completed_at = Some(Utc::now());
        }
        if to.is_open() {
            self.ledger.put(&request).await?;
        } else {
            self.ledger.remove(id).await?;
        }
        Ok(request)
    }
}

impl Default for DeletionRegistry {
    fn default() -> Self {
        Self::in_memory(Duration::hours(72))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_lifecycle() {
        let registry = DeletionRegistry::in_memory(Duration::hours(72));
        let subject: SessionKey = "s1".into();
        let now = Utc::now();

        let req = registry.request_at(&subject, now).await.unwrap();
        assert_eq!(req.status, DeletionStatus::Requested);
        assert!(registry.begin_due(now + Duration::hours(71)).await.unwrap().is_empty());

        let due = registry.begin_due(now + Duration::hours(72)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, DeletionStatus::Processing);

        let done = registry.complete(req.id).await.unwrap();
        assert_eq!(done.status, DeletionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(registry.open_count().await.unwrap(), 0);
        // Finished requests leave the ledger.
        assert!(registry.get(req.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_only_during_grace() {
        let registry = DeletionRegistry::in_memory(Duration::zero());
        let subject: SessionKey = "s1".into();

        let first = registry.request(&subject).await.unwrap();
        let cancelled = registry.cancel(first.id).await.unwrap();
        assert_eq!(cancelled.status, DeletionStatus::Cancelled);
        assert!(registry.cancel(first.id).await.is_err());

        let second = registry.request(&subject).await.unwrap();
        assert_ne!(second.id, first.id);
        registry.begin_due(Utc::now()).await.unwrap();
        assert!(registry.cancel(second.id).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_request_returns_open_one() {
        let registry = DeletionRegistry::default();
        let subject: SessionKey = "s1".into();
        let a = registry.request(&subject).await.unwrap();
        let b = registry.request(&subject).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(registry.open_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn completing_out_of_order_is_rejected() {
        let registry = DeletionRegistry::default();
        let req = registry.request(&"s1".into()).await.unwrap();
        assert!(registry.complete(req.id).await.is_err());
        assert!(registry.complete(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn released_request_is_picked_up_again() {
        let registry = DeletionRegistry::in_memory(Duration::zero());
        let req = registry.request(&"s1".into()).await.unwrap();
        registry.begin_due(Utc::now()).await.unwrap();
        registry.release(req.id).await.unwrap();
        assert_eq!(registry.begin_due(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_erasure_resumes_on_a_new_registry() {
        let ledger = Arc::new(InMemoryDeletionLedger::new());
        let first = DeletionRegistry::new(ledger.clone(), Duration::zero());
        let req = first.request(&"s1".into()).await.unwrap();
        assert_eq!(first.begin_due(Utc::now()).await.unwrap().len(), 1);
        drop(first);

        let second = DeletionRegistry::new(ledger, Duration::zero());
        assert!(second.begin_due(Utc::now()).await.unwrap().is_empty());
        assert_eq!(second.resume_interrupted().await.unwrap(), 1);
        let due = second.begin_due(Utc::now()).await.unwrap();
        assert_eq!(due[0].id, req.id);
    }

    #[tokio::test]
    async fn out_of_range_grace_is_a_config_error() {
        let registry = DeletionRegistry::in_memory(Duration::MAX);
        assert!(matches!(
            registry.request(&"s1".into()).await,
            Err(ConvoError::Config(_))
        ));
    }
}
