use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use convoguard_core::{ConvoError, ConvoResult};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce (IV) length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Deployment environment. Governs how a missing key is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local and staging deployments.
    #[default]
    Development,
    /// Production deployments. A configured key is mandatory.
    Production,
}

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generates a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> ConvoResult<Self> {
        let raw = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| ConvoError::Config(format!("encryption key is not valid base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            ConvoError::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Base64 form, suitable for configuration.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Resolve the process-wide session key.
///
/// A configured key always wins. Without one, production refuses to start and
/// every other environment gets a fresh random key for this process only.
pub fn resolve_key(env: Environment, configured: Option<&str>) -> ConvoResult<EncryptionKey> {
    match (configured.filter(|raw| !raw.trim().is_empty()), env) {
        (Some(raw), _) => EncryptionKey::from_base64(raw),
        (None, Environment::Production) => Err(ConvoError::Config(
            "no session encryption key configured; refusing to start in production".into(),
        )),
        (None, Environment::Development) => {
            warn!("No session encryption key configured, generated an ephemeral key for this process");
            Ok(EncryptionKey::generate())
        }
    }
}

/// AEAD output as persisted to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Version of the key that produced this blob.
    pub key_version: u32,
    /// Base64 nonce, fresh per encryption.
    pub iv: String,
    /// Base64 ciphertext without the tag.
    pub ciphertext: String,
    /// Base64 GCM authentication tag.
    pub auth_tag: String,
}

/// Versioned set of session keys.
///
/// New blobs are always sealed with the current key; retired keys remain
/// available for decryption until records are migrated.
pub struct Keyring {
    current_version: u32,
    keys: HashMap<u32, EncryptionKey>,
}

impl Keyring {
    /// A keyring whose current key is `key` at `version`.
    pub fn new(version: u32, key: EncryptionKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(version, key);
        Self {
            current_version: version,
            keys,
        }
    }

    /// Adds a retired key that can still decrypt older blobs.
    pub fn with_retired(mut self, version: u32, key: EncryptionKey) -> ConvoResult<Self> {
        if version == self.current_version {
            return Err(ConvoError::Config(format!(
                "retired key version {version} collides with the current key"
            )));
        }
        self.keys.insert(version, key);
        Ok(self)
    }

    /// Version used for new encryptions.
    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Seal `plaintext`, binding it to `aad` (normally the session key).
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> ConvoResult<EncryptedBlob> {
        let key = self
            .keys
            .get(&self.current_version)
            .ok_or_else(|| ConvoError::Config("current encryption key missing".into()))?;
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|_| ConvoError::Config("invalid encryption key length".into()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| ConvoError::Session("session encryption failed".into()))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedBlob {
            key_version: self.current_version,
            iv: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(sealed),
            auth_tag: BASE64.encode(tag),
        })
    }

    /// Open a blob. Any decoding, key lookup or authentication failure yields
    /// [`ConvoError::Decryption`] and no plaintext.
    pub fn decrypt(&self, blob: &EncryptedBlob, aad: &[u8]) -> ConvoResult<Vec<u8>> {
        let key = self.keys.get(&blob.key_version).ok_or_else(|| {
            ConvoError::Decryption(format!("no key for version {}", blob.key_version))
        })?;
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|_| ConvoError::Decryption("invalid encryption key length".into()))?;

        let iv = decode_field(&blob.iv, "iv")?;
        if iv.len() != NONCE_LEN {
            return Err(ConvoError::Decryption("iv has wrong length".into()));
        }
        let tag = decode_field(&blob.auth_tag, "auth_tag")?;
        if tag.len() != TAG_LEN {
            return Err(ConvoError::Decryption("auth tag has wrong length".into()));
        }
        let mut sealed = decode_field(&blob.ciphertext, "ciphertext")?;
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(Nonce::from_slice(&iv), Payload { msg: &sealed, aad })
            .map_err(|_| ConvoError::Decryption("authentication failed".into()))
    }
}

fn decode_field(value: &str, field: &str) -> ConvoResult<Vec<u8>> {
    BASE64
        .decode(value.as_bytes())
        .map_err(|e| ConvoError::Decryption(format!("{field} is not valid base64: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn keyring() -> Keyring {
        Keyring::new(1, EncryptionKey::generate())
    }

    fn flip_first_byte(encoded: &str) -> String {
        let mut raw = BASE64.decode(encoded).unwrap();
        raw[0] ^= 0x01;
        BASE64.encode(raw)
    }

    #[test]
    fn round_trip() {
        let ring = keyring();
        let blob = ring.encrypt(b"curp=ABCD800101", b"s1").unwrap();
        assert_eq!(ring.decrypt(&blob, b"s1").unwrap(), b"curp=ABCD800101");
        assert_eq!(blob.key_version, 1);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let ring = keyring();
        let blob = ring.encrypt(b"", b"s1").unwrap();
        assert!(ring.decrypt(&blob, b"s1").unwrap().is_empty());
    }

    #[test]
    fn fresh_iv_per_call() {
        let ring = keyring();
        let a = ring.encrypt(b"same", b"s1").unwrap();
        let b = ring.encrypt(b"same", b"s1").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let ring = keyring();
        let mut blob = ring.encrypt(b"secret", b"s1").unwrap();
        blob.ciphertext = flip_first_byte(&blob.ciphertext);
        assert!(matches!(
            ring.decrypt(&blob, b"s1"),
            Err(ConvoError::Decryption(_))
        ));
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let ring = keyring();
        let mut blob = ring.encrypt(b"secret", b"s1").unwrap();
        blob.auth_tag = flip_first_byte(&blob.auth_tag);
        assert!(matches!(
            ring.decrypt(&blob, b"s1"),
            Err(ConvoError::Decryption(_))
        ));
    }

    #[test]
    fn blob_bound_to_session_key() {
        let ring = keyring();
        let blob = ring.encrypt(b"secret", b"s1").unwrap();
        assert!(ring.decrypt(&blob, b"s2").is_err());
    }

    #[test]
    fn retired_key_still_decrypts() {
        let old = EncryptionKey::generate();
        let old_ring = Keyring::new(1, old.clone());
        let blob = old_ring.encrypt(b"legacy", b"s1").unwrap();

        let ring = Keyring::new(2, EncryptionKey::generate())
            .with_retired(1, old)
            .unwrap();
        assert_eq!(ring.decrypt(&blob, b"s1").unwrap(), b"legacy");
        assert_eq!(ring.encrypt(b"new", b"s1").unwrap().key_version, 2);
    }

    #[test]
    fn unknown_key_version_is_decryption_error() {
        let blob = Keyring::new(7, EncryptionKey::generate())
            .encrypt(b"x", b"s1")
            .unwrap();
        assert!(matches!(
            keyring().decrypt(&blob, b"s1"),
            Err(ConvoError::Decryption(_))
        ));
    }

    #[test]
    fn retired_version_cannot_shadow_current() {
        let result = keyring().with_retired(1, EncryptionKey::generate());
        assert!(matches!(result, Err(ConvoError::Config(_))));
    }

    #[test]
    fn production_requires_configured_key() {
        assert!(matches!(
            resolve_key(Environment::Production, None),
            Err(ConvoError::Config(_))
        ));
        assert!(resolve_key(Environment::Production, Some("  ")).is_err());
    }

    #[test]
    fn development_generates_distinct_keys() {
        let a = resolve_key(Environment::Development, None).unwrap();
        let b = resolve_key(Environment::Development, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn configured_key_round_trips_through_base64() {
        let key = EncryptionKey::generate();
        let parsed = resolve_key(Environment::Production, Some(&key.to_base64())).unwrap();
        assert_eq!(parsed, key);
        assert!(EncryptionKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn debug_redacts_key_material() {
        assert_eq!(
            format!("{:?}", EncryptionKey::generate()),
            "EncryptionKey(<redacted>)"
        );
    }
}
