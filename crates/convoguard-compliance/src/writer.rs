use crate::audit::{AuditEventType, AuditRecord, AuditStore};
use convoguard_core::SessionKey;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Audit writer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditLogConfig {
    /// Attempts per record before it is given up on.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds; doubles on every attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay ceiling in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound on a single insert, in milliseconds.
    #[serde(default = "default_insert_timeout_ms")]
    pub insert_timeout_ms: u64,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            insert_timeout_ms: default_insert_timeout_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_insert_timeout_ms() -> u64 {
    5_000
}

impl AuditLogConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

#[derive(Default)]
struct Progress {
    pending: AtomicUsize,
    written: AtomicU64,
    abandoned: AtomicU64,
    idle: Notify,
}

impl Progress {
    fn finish(&self, persisted: bool) {
        if persisted {
            self.written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Append-only privacy audit log.
///
/// [`AuditLog::append`] never blocks and never fails: records are handed to
/// a background writer, and a record whose insert fails is retried on its
/// own task with exponential backoff, so a slow or failing store never holds
/// up later records.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
    progress: Arc<Progress>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes records to `store`.
    pub fn new(store: Arc<dyn AuditStore>, config: AuditLogConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let progress = Arc::new(Progress::default());
        let config = Arc::new(config);

        let worker_progress = progress.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match try_insert(store.as_ref(), &record, &config).await {
                    Ok(()) => worker_progress.finish(true),
                    Err(e) => {
                        warn!(record_id = %record.id, error = %e, "Audit write failed, retrying in background");
                        tokio::spawn(retry(
                            store.clone(),
                            record,
                            config.clone(),
                            worker_progress.clone(),
                        ));
                    }
                }
            }
            debug!("Audit writer stopped");
        });

        Self { tx, progress }
    }

    /// Queue a record for persistence.
    pub fn append(&self, record: AuditRecord) {
        info!(
            subject = %record.subject_key,
            event = record.event_type.as_str(),
            "audit"
        );
        self.progress.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(record)) = self.tx.send(record) {
            error!(record_id = %record.id, "Audit writer is gone, record lost");
            self.progress.finish(false);
        }
    }

    /// Convenience wrapper around [`AuditLog::append`].
    pub fn record(&self, subject: &SessionKey, event_type: AuditEventType, metadata: serde_json::Value) {
        self.append(AuditRecord::new(subject.clone(), event_type, metadata));
    }

    /// Records accepted but not yet persisted or given up on.
    pub fn pending(&self) -> usize {
        self.progress.pending.load(Ordering::Acquire)
    }

    /// Records persisted so far.
    pub fn written(&self) -> u64 {
        self.progress.written.load(Ordering::Relaxed)
    }

    /// Records dropped after exhausting their retries.
    pub fn abandoned(&self) -> u64 {
        self.progress.abandoned.load(Ordering::Relaxed)
    }

    /// Wait until every accepted record is persisted or abandoned.
    pub async fn settled(&self) {
        loop {
            let idle = self.progress.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

async fn try_insert(
    store: &dyn AuditStore,
    record: &AuditRecord,
    config: &AuditLogConfig,
) -> convoguard_core::ConvoResult<()> {
    let timeout = Duration::from_millis(config.insert_timeout_ms);
    match tokio::time::timeout(timeout, store.insert(record)).await {
        Ok(result) => result,
        Err(_) => Err(convoguard_core::ConvoError::AuditWrite(format!(
            "insert timed out after {}ms",
            config.insert_timeout_ms
        ))),
    }
}

async fn retry(
    store: Arc<dyn AuditStore>,
    record: AuditRecord,
    config: Arc<AuditLogConfig>,
    progress: Arc<Progress>,
) {
    for attempt in 1..=config.max_retries {
        tokio::time::sleep(config.backoff(attempt)).await;
        match try_insert(store.as_ref(), &record, &config).await {
            Ok(()) => {
                debug!(record_id = %record.id, attempt, "Audit record written on retry");
                progress.finish(true);
                return;
            }
            Err(e) => {
                warn!(record_id = %record.id, attempt, error = %e, "Audit retry failed");
            }
        }
    }
    error!(
        record_id = %record.id,
        subject = %record.subject_key,
        event = record.event_type.as_str(),
        "Audit record abandoned after retries"
    );
    progress.finish(false);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::{InMemoryAuditStore, RetentionCategory};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use convoguard_core::{ConvoError, ConvoResult};
    use std::sync::atomic::AtomicU32;

    /// Store that fails its first `failures` inserts.
    struct FlakyStore {
        inner: InMemoryAuditStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn insert(&self, record: &AuditRecord) -> ConvoResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ConvoError::AuditWrite("disk full".into()));
            }
            self.inner.insert(record).await
        }
        async fn for_subject(&self, subject: &SessionKey) -> ConvoResult<Vec<AuditRecord>> {
            self.inner.for_subject(subject).await
        }
        async fn purge_expired(
            &self,
            category: RetentionCategory,
            cutoff: DateTime<Utc>,
            batch_size: usize,
        ) -> ConvoResult<usize> {
            self.inner.purge_expired(category, cutoff, batch_size).await
        }
        async fn count(&self) -> ConvoResult<usize> {
            self.inner.count().await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryAuditStore::new(),
            failures: AtomicU32::new(failures),
        })
    }

    #[tokio::test]
    async fn append_persists_in_background() {
        let store = Arc::new(InMemoryAuditStore::new());
        let log = AuditLog::new(store.clone(), AuditLogConfig::default());
        let subject: SessionKey = "s1".into();
        log.record(&subject, AuditEventType::ConsentGranted, serde_json::json!({}));
        log.record(&subject, AuditEventType::DataModified, serde_json::json!({"version": 1}));
        log.settled().await;

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(log.written(), 2);
        assert_eq!(log.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_insert_is_retried_exactly_once_persisted() {
        let store = flaky(2);
        let log = AuditLog::new(store.clone(), AuditLogConfig::default());
        log.record(&"s1".into(), AuditEventType::DataAccessed, serde_json::json!({}));
        log.settled().await;

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(log.abandoned(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let store = flaky(100);
        let config = AuditLogConfig {
            max_retries: 3,
            ..AuditLogConfig::default()
        };
        let log = AuditLog::new(store.clone(), config);
        log.record(&"s1".into(), AuditEventType::DataAccessed, serde_json::json!({}));
        log.settled().await;

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(log.abandoned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_record_does_not_block_later_ones() {
        let store = flaky(1);
        let log = AuditLog::new(store.clone(), AuditLogConfig::default());
        log.record(&"s1".into(), AuditEventType::ConsentRequested, serde_json::json!({}));
        log.record(&"s2".into(), AuditEventType::ConsentRequested, serde_json::json!({}));

        // The second record lands before the first one's backoff elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.for_subject(&"s2".into()).await.unwrap().len(), 1);
        assert!(store.for_subject(&"s1".into()).await.unwrap().is_empty());

        log.settled().await;
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let config = AuditLogConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(30), Duration::from_millis(30_000));
    }
}
