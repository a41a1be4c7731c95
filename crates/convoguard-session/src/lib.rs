//! Session state caching and encrypted persistence.
//!
//! # Main types
//!
//! - [`StateCache`] — Bounded LRU cache of decrypted session state.
//! - [`KvBackend`] — Durable key-value backend trait ([`InMemoryKv`], [`FileKv`]).
//! - [`EncryptedSessionStore`] — Seals every session before it reaches the backend.
//! - [`migrate::reencrypt_all`] — Offline re-encryption under a new key.

/// Durable key-value backends.
pub mod backend;
/// Bounded LRU state cache.
pub mod cache;
pub mod migrate;
/// The encrypted session store.
pub mod store;

pub use backend::{FileKv, InMemoryKv, KvBackend};
pub use cache::StateCache;
pub use migrate::MigrationReport;
pub use store::{EncryptedSessionStore, StoredSession};
