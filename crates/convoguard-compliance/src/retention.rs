use crate::audit::{AuditStore, RetentionCategory};
use chrono::{DateTime, Duration, Utc};
use convoguard_core::{ConvoError, ConvoResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Retention windows per data category.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionPolicy {
    /// Audit trail retention, in days.
    #[serde(default = "default_audit_log_days")]
    pub audit_log_days: i64,
    /// Inactive conversation retention, in hours.
    #[serde(default = "default_session_hours")]
    pub session_hours: i64,
    /// Application artifact retention, in days.
    #[serde(default = "default_artifact_days")]
    pub artifact_days: i64,
    /// Rows removed per transaction during a sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Time an erasure request waits before it is processed, in hours.
    #[serde(default = "default_deletion_grace_hours")]
    pub deletion_grace_hours: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            audit_log_days: default_audit_log_days(),
            session_hours: default_session_hours(),
            artifact_days: default_artifact_days(),
            batch_size: default_batch_size(),
            deletion_grace_hours: default_deletion_grace_hours(),
        }
    }
}

fn default_audit_log_days() -> i64 {
    730
}
fn default_session_hours() -> i64 {
    24
}
fn default_artifact_days() -> i64 {
    3_650
}
fn default_batch_size() -> usize {
    500
}
fn default_deletion_grace_hours() -> i64 {
    72
}

impl RetentionPolicy {
    /// Reject windows that are negative or too large to subtract from the
    /// current time. Run once at startup.
    pub fn validate(&self) -> ConvoResult<()> {
        let now = Utc::now();
        let checks = [
            ("audit_log_days", self.audit_log_days, Duration::try_days(self.audit_log_days)),
            ("session_hours", self.session_hours, Duration::try_hours(self.session_hours)),
            ("artifact_days", self.artifact_days, Duration::try_days(self.artifact_days)),
            (
                "deletion_grace_hours",
                self.deletion_grace_hours,
                Duration::try_hours(self.deletion_grace_hours),
            ),
        ];
        for (name, raw, window) in checks {
            let in_range = raw >= 0
                && window.is_some_and(|w| {
                    now.checked_sub_signed(w).is_some() && now.checked_add_signed(w).is_some()
                });
            if !in_range {
                return Err(ConvoError::Config(format!(
                    "retention.{name} = {raw} is out of range"
                )));
            }
        }
        Ok(())
    }

    /// How long data in `category` is kept. Out-of-range settings saturate.
    pub fn window(&self, category: RetentionCategory) -> Duration {
        let window = match category {
            RetentionCategory::AuditLog => Duration::try_days(self.audit_log_days),
            RetentionCategory::SessionData => Duration::try_hours(self.session_hours),
            RetentionCategory::ApplicationArtifact => Duration::try_days(self.artifact_days),
        };
        window.unwrap_or(Duration::MAX)
    }

    /// Oldest timestamp still retained in `category` as of `now`.
    pub fn cutoff(&self, category: RetentionCategory, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window(category))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Grace period for erasure requests.
    pub fn deletion_grace(&self) -> Duration {
        Duration::try_hours(self.deletion_grace_hours).unwrap_or(Duration::MAX)
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Audit records removed.
    pub audit_records: usize,
    /// Inactive sessions removed.
    pub sessions: usize,
    /// Transactions committed.
    pub batches: usize,
}

/// Purge expired audit records, one bounded transaction at a time.
///
/// Stops for a category once a batch comes back short. A failed batch aborts
/// the sweep; batches committed before it stay committed.
pub async fn sweep_audit(
    store: &dyn AuditStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> ConvoResult<SweepReport> {
    let batch_size = policy.batch_size.max(1);
    let mut report = SweepReport::default();
    for category in RetentionCategory::ALL {
        let cutoff = policy.cutoff(category, now);
        loop {
            let deleted = store.purge_expired(category, cutoff, batch_size).await?;
            report.batches += 1;
            report.audit_records += deleted;
            if deleted < batch_size {
                break;
            }
        }
    }
    if report.audit_records > 0 {
        info!(
            removed = report.audit_records,
            batches = report.batches,
            "Retention sweep purged audit records"
        );
    }
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditRecord, InMemoryAuditStore};

    async fn seed(store: &InMemoryAuditStore, count: usize, age: Duration, category: RetentionCategory) {
        for _ in 0..count {
            let mut r = AuditRecord::new("s1".into(), AuditEventType::DataModified, serde_json::json!({}))
                .in_category(category);
            r.timestamp = Utc::now() - age;
            store.insert(&r).await.unwrap();
        }
    }

    #[test]
    fn default_windows() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.window(RetentionCategory::AuditLog), Duration::days(730));
        assert_eq!(policy.window(RetentionCategory::SessionData), Duration::hours(24));
        assert_eq!(
            policy.window(RetentionCategory::ApplicationArtifact),
            Duration::days(3_650)
        );
    }

    #[test]
    fn huge_windows_never_panic() {
        let policy = RetentionPolicy {
            audit_log_days: i64::MAX,
            artifact_days: 200_000_000,
            ..RetentionPolicy::default()
        };
        let now = Utc::now();
        assert_eq!(policy.cutoff(RetentionCategory::AuditLog, now), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            policy.cutoff(RetentionCategory::ApplicationArtifact, now),
            DateTime::<Utc>::MIN_UTC
        );
        assert!(matches!(policy.validate(), Err(ConvoError::Config(_))));
    }

    #[test]
    fn negative_window_is_rejected() {
        let policy = RetentionPolicy {
            session_hours: -1,
            ..RetentionPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(ConvoError::Config(_))));
        assert!(RetentionPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn sweep_with_saturated_window_keeps_everything() {
        let store = InMemoryAuditStore::new();
        seed(&store, 3, Duration::days(5_000), RetentionCategory::AuditLog).await;
        let policy = RetentionPolicy {
            audit_log_days: i64::MAX,
            ..RetentionPolicy::default()
        };
        let report = sweep_audit(&store, &policy, Utc::now()).await.unwrap();
        assert_eq!(report.audit_records, 0);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_records() {
        let store = InMemoryAuditStore::new();
        seed(&store, 12, Duration::days(731), RetentionCategory::AuditLog).await;
        seed(&store, 3, Duration::days(100), RetentionCategory::AuditLog).await;
        seed(&store, 4, Duration::hours(25), RetentionCategory::SessionData).await;
        seed(&store, 2, Duration::days(731), RetentionCategory::ApplicationArtifact).await;

        let policy = RetentionPolicy {
            batch_size: 5,
            ..RetentionPolicy::default()
        };
        let report = sweep_audit(&store, &policy, Utc::now()).await.unwrap();

        assert_eq!(report.audit_records, 16);
        // 12 audit rows in batches of 5 (5, 5, 2), one short batch each for the others.
        assert_eq!(report.batches, 5);
        assert_eq!(store.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn sweep_on_empty_store_is_a_noop() {
        let store = InMemoryAuditStore::new();
        let report = sweep_audit(&store, &RetentionPolicy::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.audit_records, 0);
    }
}
