use crate::audit::{AuditEventType, AuditRecord, AuditStore, RetentionCategory};
use crate::deletion::{DeletionLedger, DeletionRequest, DeletionStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use convoguard_core::{ConvoError, ConvoResult, SessionKey};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_records (
    id          TEXT PRIMARY KEY,
    subject_key TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    category    TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    metadata    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_records (subject_key);
CREATE INDEX IF NOT EXISTS idx_audit_expiry ON audit_records (category, timestamp);

CREATE TABLE IF NOT EXISTS deletion_requests (
    id           TEXT PRIMARY KEY,
    subject_key  TEXT NOT NULL,
    status       TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    grace_until  TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_deletion_subject ON deletion_requests (subject_key, status);
CREATE INDEX IF NOT EXISTS idx_deletion_due ON deletion_requests (status, grace_until);
";

/// Audit store on a single SQLite database. The same database also holds
/// the open erasure requests ([`DeletionLedger`]).
///
/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that range
/// comparisons can be done on the text column.
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

type RawRow = (String, String, String, String, String, String);
type RawDeletionRow = (String, String, String, String, String, Option<String>);

const DELETION_COLUMNS: &str = "id, subject_key, status, requested_at, grace_until, completed_at";

impl SqliteAuditStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> ConvoResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::with_connection(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> ConvoResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> ConvoResult<Self> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> ConvoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| ConvoError::AuditWrite(format!("audit task failed: {e}")))?
        .map_err(sql_err)
    }
}

fn sql_err(e: rusqlite::Error) -> ConvoError {
    ConvoError::AuditWrite(e.to_string())
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_row(row: RawRow) -> ConvoResult<AuditRecord> {
    let (id, subject, event, category, timestamp, metadata) = row;
    let corrupt = |what: &str| ConvoError::AuditWrite(format!("corrupt audit row {id}: bad {what}"));
    Ok(AuditRecord {
        id: Uuid::parse_str(&id).map_err(|_| corrupt("id"))?,
        subject_key: SessionKey::new(subject),
        event_type: AuditEventType::parse(&event).ok_or_else(|| corrupt("event_type"))?,
        category: RetentionCategory::parse(&category).ok_or_else(|| corrupt("category"))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|_| corrupt("timestamp"))?
            .with_timezone(&Utc),
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn decode_deletion(row: RawDeletionRow) -> ConvoResult<DeletionRequest> {
    let (id, subject, status, requested_at, grace_until, completed_at) = row;
    let corrupt = |what: &str| ConvoError::AuditWrite(format!("corrupt deletion row {id}: bad {what}"));
    Ok(DeletionRequest {
        id: Uuid::parse_str(&id).map_err(|_| corrupt("id"))?,
        subject_key: SessionKey::new(subject),
        status: DeletionStatus::parse(&status).ok_or_else(|| corrupt("status"))?,
        requested_at: parse_ts(&requested_at).ok_or_else(|| corrupt("requested_at"))?,
        grace_until: parse_ts(&grace_until).ok_or_else(|| corrupt("grace_until"))?,
        completed_at: match completed_at {
            Some(raw) => Some(parse_ts(&raw).ok_or_else(|| corrupt("completed_at"))?),
            None => None,
        },
    })
}

fn deletion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDeletionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl SqliteAuditStore {
    /// Deletion rows matching `filter` (a `WHERE` clause over `params`).
    async fn select_deletions(
        &self,
        filter: &'static str,
        params: Vec<String>,
    ) -> ConvoResult<Vec<DeletionRequest>> {
        let rows: Vec<RawDeletionRow> = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {DELETION_COLUMNS} FROM deletion_requests WHERE {filter} ORDER BY requested_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), deletion_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_deletion).collect()
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn insert(&self, record: &AuditRecord) -> ConvoResult<()> {
        let id = record.id.to_string();
        let subject = record.subject_key.as_str().to_string();
        let event = record.event_type.as_str();
        let category = record.category.as_str();
        let timestamp = format_ts(&record.timestamp);
        let metadata = serde_json::to_string(&record.metadata)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO audit_records
                 (id, subject_key, event_type, category, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, subject, event, category, timestamp, metadata],
            )
            .map(|_| ())
        })
        .await
    }

    async fn for_subject(&self, subject: &SessionKey) -> ConvoResult<Vec<AuditRecord>> {
        let subject = subject.as_str().to_string();
        let rows: Vec<RawRow> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_key, event_type, category, timestamp, metadata
                     FROM audit_records WHERE subject_key = ?1 ORDER BY timestamp",
                )?;
                let rows = stmt
                    .query_map(params![subject], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<RawRow>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn purge_expired(
        &self,
        category: RetentionCategory,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> ConvoResult<usize> {
        let category = category.as_str();
        let cutoff = format_ts(&cutoff);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM audit_records WHERE id IN (
                     SELECT id FROM audit_records
                     WHERE category = ?1 AND timestamp < ?2
                     LIMIT ?3
                 )",
                params![category, cutoff, limit],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn count(&self) -> ConvoResult<usize> {
        let count: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl DeletionLedger for SqliteAuditStore {
    async fn put(&self, request: &DeletionRequest) -> ConvoResult<()> {
        let id = request.id.to_string();
        let subject = request.subject_key.as_str().to_string();
        let status = request.status.as_str();
        let requested_at = format_ts(&request.requested_at);
        let grace_until = format_ts(&request.grace_until);
        let completed_at = request.completed_at.as_ref().map(format_ts);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO deletion_requests
                 (id, subject_key, status, requested_at, grace_until, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, subject, status, requested_at, grace_until, completed_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> ConvoResult<Option<DeletionRequest>> {
        Ok(self
            .select_deletions("id = ?1", vec![id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn open_for(&self, subject: &SessionKey) -> ConvoResult<Option<DeletionRequest>> {
        Ok(self
            .select_deletions(
                "subject_key = ?1 AND status IN ('requested', 'processing')",
                vec![subject.as_str().to_string()],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn in_status(&self, status: DeletionStatus) -> ConvoResult<Vec<DeletionRequest>> {
        self.select_deletions("status = ?1", vec![status.as_str().to_string()])
            .await
    }

    async fn due(&self, now: DateTime<Utc>) -> ConvoResult<Vec<DeletionRequest>> {
        self.select_deletions(
            "status = ?1 AND grace_until <= ?2",
            vec![DeletionStatus::Requested.as_str().to_string(), format_ts(&now)],
        )
        .await
    }

    async fn remove(&self, id: Uuid) -> ConvoResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM deletion_requests WHERE id = ?1", params![id])
                .map(|n| n > 0)
        })
        .await
    }

    async fn open_count(&self) -> ConvoResult<usize> {
        let count: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM deletion_requests", [], |row| row.get(0))
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
