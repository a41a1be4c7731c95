//! Offline re-encryption of stored sessions under a new key.
//!
//! The keyring passed in must hold the new key as current and every key that
//! may have sealed an existing record as retired. Records that cannot be
//! opened are left untouched and reported; nothing is ever deleted.

use crate::backend::KvBackend;
use crate::store::{StoredSession, SESSION_PREFIX};
use convoguard_core::ConvoResult;
use convoguard_security::Keyring;
use serde::Serialize;
use tracing::{info, warn};

/// Outcome of a migration run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MigrationReport {
    /// Records re-sealed under the current key.
    pub migrated: usize,
    /// Records already sealed under the current key.
    pub already_current: usize,
    /// Records that could not be migrated, with the reason.
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    /// Whether every record is now under the current key.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Re-encrypt every session in `backend` under `keyring`'s current key.
///
/// Envelope version and timestamp are preserved so the migration is invisible
/// to conflict checks and retention.
pub async fn reencrypt_all(
    backend: &dyn KvBackend,
    keyring: &Keyring,
) -> ConvoResult<MigrationReport> {
    let mut report = MigrationReport::default();
    let target = keyring.current_version();

    for backend_key in backend.keys().await? {
        let Some(session_key) = backend_key.strip_prefix(SESSION_PREFIX) else {
            continue;
        };
        let Some(raw) = backend.get(&backend_key).await? else {
            continue;
        };

        match reseal(&raw, session_key, keyring, target) {
            Ok(Some(updated)) => {
                backend.set(&backend_key, updated).await?;
                report.migrated += 1;
            }
            Ok(None) => report.already_current += 1,
            Err(e) => {
                warn!(session = %session_key, error = %e, "Session could not be migrated");
                report.failed.push((session_key.to_string(), e.to_string()));
            }
        }
    }

    info!(
        migrated = report.migrated,
        already_current = report.already_current,
        failed = report.failed.len(),
        key_version = target,
        "Session key migration finished"
    );
    Ok(report)
}

fn reseal(
    raw: &str,
    session_key: &str,
    keyring: &Keyring,
    target: u32,
) -> ConvoResult<Option<String>> {
    let mut envelope = StoredSession::parse(raw)?;
    if envelope.blob.key_version == target {
        return Ok(None);
    }
    let aad = session_key.as_bytes();
    let plaintext = keyring.decrypt(&envelope.blob, aad)?;
    envelope.blob = keyring.encrypt(&plaintext, aad)?;
    Ok(Some(serde_json::to_string(&envelope)?))
}
