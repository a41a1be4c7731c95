use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use convoguard_core::ConvoResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

/// Durable key-value backend holding encrypted session envelopes.
///
/// Values are opaque strings; the session store never hands plaintext to a
/// backend.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> ConvoResult<Option<String>>;
    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> ConvoResult<()>;
    /// Remove `key`. Returns whether a value existed.
    async fn delete(&self, key: &str) -> ConvoResult<bool>;
    /// List every stored key.
    async fn keys(&self) -> ConvoResult<Vec<String>>;
}

/// Process-local backend, for tests and single-process development.
#[derive(Default)]
pub struct InMemoryKv {
    map: RwLock<HashMap<String, String>>,
}

impl InMemoryKv {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn get(&self, key: &str) -> ConvoResult<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> ConvoResult<()> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConvoResult<bool> {
        Ok(self.map.write().remove(key).is_some())
    }

    async fn keys(&self) -> ConvoResult<Vec<String>> {
        Ok(self.map.read().keys().cloned().collect())
    }
}

/// File-based backend: one JSON file per key. Good enough for single-node
/// deployments and for running key migrations offline.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Open (creating if needed) a backend rooted at `dir`.
    pub async fn new(dir: PathBuf) -> ConvoResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }
}

#[async_trait]
impl KvBackend for FileKv {
    async fn get(&self, key: &str) -> ConvoResult<Option<String>> {
        match tokio::fs::read_to_string(self.entry_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> ConvoResult<()> {
        // Write then rename so readers never observe a torn file.
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConvoResult<bool> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> ConvoResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(raw) = URL_SAFE_NO_PAD.decode(stem) {
                        if let Ok(key) = String::from_utf8(raw) {
                            keys.push(key);
                        }
                    }
                }
            }
        }
        Ok(keys)
    }
}
