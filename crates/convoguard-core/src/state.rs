use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a conversation, usually the sender's phone number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wraps a raw identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-conversation state.
///
/// The payload belongs to the external decision engine and is never
/// inspected here. `version` starts at 0 for a state that has never been
/// persisted and increases by one on every successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// The conversation this state belongs to.
    pub key: SessionKey,
    /// Opaque payload owned by the decision engine.
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    /// When the conversation was first seen.
    pub created_at: DateTime<Utc>,
    /// Last time an inbound event or operator read touched the state.
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonic version used for optimistic consistency.
    pub version: u64,
}

impl SessionState {
    /// Creates a fresh, never-persisted state with an empty payload.
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            payload: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            version: 0,
        }
    }

    /// Returns the successor of this state carrying `payload`.
    ///
    /// The version is bumped and the access time refreshed; the original is
    /// left untouched so a failed save can be discarded cleanly.
    pub fn advance(&self, payload: Vec<u8>) -> Self {
        Self {
            key: self.key.clone(),
            payload,
            created_at: self.created_at,
            last_accessed_at: Utc::now(),
            version: self.version + 1,
        }
    }

    /// Whether the state has never been written to the durable store.
    pub fn is_fresh(&self) -> bool {
        self.version == 0
    }
}

mod payload_b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_version_zero() {
        let state = SessionState::new("+5215512345678".into());
        assert!(state.is_fresh());
        assert!(state.payload.is_empty());
    }

    #[test]
    fn advance_bumps_version_and_keeps_original() {
        let state = SessionState::new("s1".into());
        let next = state.advance(b"{\"step\":\"consent\"}".to_vec());
        assert_eq!(next.version, 1);
        assert_eq!(next.created_at, state.created_at);
        assert!(state.payload.is_empty());
        assert!(!next.is_fresh());
    }

    #[test]
    fn payload_serializes_as_base64() {
        let mut state = SessionState::new("s1".into());
        state.payload = vec![0, 159, 146, 150];
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["payload"], "AJ+Slg==");
        let back: SessionState = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, vec![0, 159, 146, 150]);
    }

    #[test]
    fn session_key_is_transparent() {
        let key = SessionKey::new("abc");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"abc\"");
        assert_eq!(key.to_string(), "abc");
    }
}
