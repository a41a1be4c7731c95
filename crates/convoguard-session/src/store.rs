use crate::backend::KvBackend;
use chrono::{DateTime, Utc};
use convoguard_core::{ConvoError, ConvoResult, SessionKey, SessionState};
use convoguard_security::{EncryptedBlob, Keyring};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backend key prefix for session envelopes.
pub const SESSION_PREFIX: &str = "session:";

/// Backend key for a session.
pub fn backend_key(key: &SessionKey) -> String {
    format!("{SESSION_PREFIX}{key}")
}

/// What actually lands in the backend.
///
/// Only `version` and `updated_at` are readable without the key; they carry
/// no personal data and let conflict checks and retention sweeps run without
/// decrypting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    /// Version of the sealed state.
    pub version: u64,
    /// When the envelope was written.
    pub updated_at: DateTime<Utc>,
    /// The sealed [`SessionState`].
    #[serde(flatten)]
    pub blob: EncryptedBlob,
}

impl StoredSession {
    /// Parse an envelope. Malformed envelopes are reported as decryption
    /// failures so callers treat them exactly like tampered ciphertext.
    pub fn parse(raw: &str) -> ConvoResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ConvoError::Decryption(format!("malformed session envelope: {e}")))
    }
}

/// Session store that encrypts every state before it reaches the backend.
pub struct EncryptedSessionStore {
    backend: Arc<dyn KvBackend>,
    keyring: Arc<Keyring>,
}

impl EncryptedSessionStore {
    /// Create a store over `backend`, sealing with `keyring`.
    pub fn new(backend: Arc<dyn KvBackend>, keyring: Arc<Keyring>) -> Self {
        Self { backend, keyring }
    }

    /// Persist `state`.
    ///
    /// The state's version must be exactly one past the stored version (or 1
    /// for a session that was never stored); anything else is a
    /// [`ConvoError::Conflict`].
    pub async fn save(&self, state: &SessionState) -> ConvoResult<()> {
        if state.version == 0 {
            return Err(ConvoError::Session(format!(
                "refusing to persist unversioned state for {}",
                state.key
            )));
        }
        let expected_previous = state.version - 1;
        let stored_version = self.stored_version(&state.key).await?.unwrap_or(0);
        if stored_version != expected_previous {
            return Err(ConvoError::Conflict(format!(
                "session {} is at version {stored_version}, write expects {expected_previous}",
                state.key
            )));
        }

        let plaintext = serde_json::to_vec(state)?;
        let blob = self.keyring.encrypt(&plaintext, state.key.as_str().as_bytes())?;
        let envelope = StoredSession {
            version: state.version,
            updated_at: Utc::now(),
            blob,
        };
        self.backend
            .set(&backend_key(&state.key), serde_json::to_string(&envelope)?)
            .await?;
        debug!(session = %state.key, version = state.version, "Session saved");
        Ok(())
    }

    /// Load and authenticate a session.
    ///
    /// Returns `Ok(None)` when nothing is stored and
    /// [`ConvoError::Decryption`] when the envelope cannot be opened.
    pub async fn load(&self, key: &SessionKey) -> ConvoResult<Option<SessionState>> {
        let Some(raw) = self.backend.get(&backend_key(key)).await? else {
            return Ok(None);
        };
        let envelope = StoredSession::parse(&raw)?;
        let plaintext = self
            .keyring
            .decrypt(&envelope.blob, key.as_str().as_bytes())?;
        let state: SessionState = serde_json::from_slice(&plaintext)
            .map_err(|e| ConvoError::Decryption(format!("sealed state is not a session: {e}")))?;

        if state.key != *key || state.version != envelope.version {
            return Err(ConvoError::Decryption(format!(
                "envelope for {key} does not match its sealed state"
            )));
        }
        Ok(Some(state))
    }

    /// Remove a session. Returns whether one existed.
    pub async fn delete(&self, key: &SessionKey) -> ConvoResult<bool> {
        let removed = self.backend.delete(&backend_key(key)).await?;
        if removed {
            info!(session = %key, "Session deleted from durable store");
        }
        Ok(removed)
    }

    /// Version currently stored for `key`, read without decrypting.
    pub async fn stored_version(&self, key: &SessionKey) -> ConvoResult<Option<u64>> {
        match self.backend.get(&backend_key(key)).await? {
            Some(raw) => Ok(Some(StoredSession::parse(&raw)?.version)),
            None => Ok(None),
        }
    }

    /// Every session key present in the backend.
    pub async fn list(&self) -> ConvoResult<Vec<SessionKey>> {
        Ok(self
            .backend
            .keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_PREFIX).map(SessionKey::from))
            .collect())
    }

    /// Keys of sessions not written since `cutoff`. Nothing is removed.
    /// Unreadable envelopes are skipped and logged.
    pub async fn inactive_since(&self, cutoff: DateTime<Utc>) -> ConvoResult<Vec<SessionKey>> {
        let mut stale = Vec::new();
        for key in self.list().await? {
            let Some(raw) = self.backend.get(&backend_key(&key)).await? else {
                continue;
            };
            match StoredSession::parse(&raw) {
                Ok(envelope) if envelope.updated_at < cutoff => stale.push(key),
                Ok(_) => {}
                Err(e) => warn!(session = %key, error = %e, "Skipping unreadable session during purge"),
            }
        }
        Ok(stale)
    }

    /// Delete `key` if its envelope is still older than `cutoff`.
    ///
    /// Re-reads the envelope, so a session written after it was picked as a
    /// candidate survives. Callers serialize this with writers of the same key.
    pub async fn delete_if_inactive(&self, key: &SessionKey, cutoff: DateTime<Utc>) -> ConvoResult<bool> {
        let Some(raw) = self.backend.get(&backend_key(key)).await? else {
            return Ok(false);
        };
        match StoredSession::parse(&raw) {
            Ok(envelope) if envelope.updated_at < cutoff => self.backend.delete(&backend_key(key)).await,
            Ok(_) => {
                debug!(session = %key, "Session written since it went stale, kept");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    /// Delete every session not written since `cutoff`. Returns the removed
    /// keys. Unreadable envelopes are skipped and logged, never deleted here.
    pub async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> ConvoResult<Vec<SessionKey>> {
        let mut purged = Vec::new();
        for key in self.inactive_since(cutoff).await? {
            if self.delete_if_inactive(&key, cutoff).await? {
                purged.push(key);
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged inactive sessions");
        }
        Ok(purged)
    }

    /// The keyring sealing this store.
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }
}
