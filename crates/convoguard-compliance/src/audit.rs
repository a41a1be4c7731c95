use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoguard_core::{ConvoResult, SessionKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of privacy-relevant event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    /// The subject was asked for consent.
    ConsentRequested,
    /// The subject granted consent.
    ConsentGranted,
    /// The subject refused or withdrew consent.
    ConsentDenied,
    /// Personal data was read (by the conversation flow or an operator).
    DataAccessed,
    /// Personal data was changed.
    DataModified,
    /// The subject asked for erasure.
    DeletionRequested,
    /// The subject withdrew an erasure request during its grace period.
    DeletionCancelled,
    /// Erasure finished.
    DeletionCompleted,
}

impl AuditEventType {
    /// Wire name, as stored in the audit table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsentRequested => "consent-requested",
            Self::ConsentGranted => "consent-granted",
            Self::ConsentDenied => "consent-denied",
            Self::DataAccessed => "data-accessed",
            Self::DataModified => "data-modified",
            Self::DeletionRequested => "deletion-requested",
            Self::DeletionCancelled => "deletion-cancelled",
            Self::DeletionCompleted => "deletion-completed",
        }
    }

    /// Inverse of [`AuditEventType::as_str`].
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "consent-requested" => Self::ConsentRequested,
            "consent-granted" => Self::ConsentGranted,
            "consent-denied" => Self::ConsentDenied,
            "data-accessed" => Self::DataAccessed,
            "data-modified" => Self::DataModified,
            "deletion-requested" => Self::DeletionRequested,
            "deletion-cancelled" => Self::DeletionCancelled,
            "deletion-completed" => Self::DeletionCompleted,
            _ => return None,
        })
    }
}

/// Retention bucket a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionCategory {
    /// Regular audit trail.
    #[default]
    AuditLog,
    /// Records tied to live conversation data.
    SessionData,
    /// Records tied to a completed application, kept for legal/tax reasons.
    ApplicationArtifact,
}

impl RetentionCategory {
    /// All categories, in sweep order.
    pub const ALL: [RetentionCategory; 3] = [
        RetentionCategory::AuditLog,
        RetentionCategory::SessionData,
        RetentionCategory::ApplicationArtifact,
    ];

    /// Stored name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuditLog => "audit_log",
            Self::SessionData => "session_data",
            Self::ApplicationArtifact => "application_artifact",
        }
    }

    /// Inverse of [`RetentionCategory::as_str`].
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "audit_log" => Self::AuditLog,
            "session_data" => Self::SessionData,
            "application_artifact" => Self::ApplicationArtifact,
            _ => return None,
        })
    }
}

/// An immutable audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique id; inserts are idempotent on it.
    pub id: Uuid,
    /// Conversation the event concerns.
    pub subject_key: SessionKey,
    /// What happened.
    pub event_type: AuditEventType,
    /// Retention bucket.
    pub category: RetentionCategory,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Non-personal context (actor, version, request id).
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    /// A new audit-log record timestamped now.
    pub fn new(
        subject_key: SessionKey,
        event_type: AuditEventType,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_key,
            event_type,
            category: RetentionCategory::AuditLog,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Same record in another retention category.
    pub fn in_category(mut self, category: RetentionCategory) -> Self {
        self.category = category;
        self
    }
}

/// Insert-only audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a record. Inserting an id that already exists is a no-op.
    async fn insert(&self, record: &AuditRecord) -> ConvoResult<()>;
    /// All records for a subject, oldest first.
    async fn for_subject(&self, subject: &SessionKey) -> ConvoResult<Vec<AuditRecord>>;
    /// Delete up to `batch_size` records of `category` older than `cutoff`
    /// in a single transaction. Returns how many were deleted.
    async fn purge_expired(
        &self,
        category: RetentionCategory,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> ConvoResult<usize>;
    /// Total number of stored records.
    async fn count(&self) -> ConvoResult<usize>;
}

/// In-memory audit store.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in insertion order.
    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> ConvoResult<()> {
        let mut records = self.records.write();
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn for_subject(&self, subject: &SessionKey) -> ConvoResult<Vec<AuditRecord>> {
        let mut found: Vec<AuditRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.subject_key == *subject)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }

    async fn purge_expired(
        &self,
        category: RetentionCategory,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> ConvoResult<usize> {
        // The write lock makes the batch atomic.
        let mut records = self.records.write();
        let mut deleted = 0;
        records.retain(|r| {
            let expired = r.category == category && r.timestamp < cutoff;
            if expired && deleted < batch_size {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn count(&self) -> ConvoResult<usize> {
        Ok(self.records.read().len())
    }
}

/// Latest consent decision recorded for `subject`, if any.
pub async fn consent_status(store: &dyn AuditStore, subject: &SessionKey) -> ConvoResult<Option<bool>> {
    let records = store.for_subject(subject).await?;
    Ok(records.iter().rev().find_map(|r| match r.event_type {
        AuditEventType::ConsentGranted => Some(true),
        AuditEventType::ConsentDenied => Some(false),
        _ => None,
    }))
}
