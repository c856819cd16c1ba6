use serde::Serialize;
use serde::de::DeserializeOwned;
use slatedb::Db;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pkg_constants::state::{EVENT_LOG_CAPACITY, MAX_MUTATE_ATTEMPTS, UNWATCHED_PREFIXES};

use crate::watch::{EventLog, EventType};

/// Persistent state store backed by SlateDB.
///
/// Every mutation is also appended to `event_log`, which is what the
/// controllers subscribe to.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    /// Held by every write so a compare-and-swap sees no interleaved writer.
    write_gate: Arc<Mutex<()>>,
    pub event_log: EventLog,
}

/// What [`StateStore::mutate_json`] should do with the object it read.
#[derive(Debug)]
pub enum Mutation<T> {
    Put(T),
    Delete,
    Keep,
}

fn is_watched(key: &str) -> bool {
    !UNWATCHED_PREFIXES.iter().any(|p| key.starts_with(p))
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        Self::open(object_store).await
    }

    /// Open a store that lives only in memory. Used by tests and by
    /// throwaway member clusters in local setups.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::open(Arc::new(InMemory::new())).await
    }

    async fn open(object_store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            write_gate: Arc::new(Mutex::new(())),
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
        })
    }

    /// Store a value under the given key.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let _gate = self.write_gate.lock().await;
        self.write(key, Some(value)).await
    }

    /// Apply one write and log it. Callers hold `write_gate`.
    async fn write(&self, key: &str, value: Option<&[u8]>) -> anyhow::Result<()> {
        match value {
            Some(value) => self
                .db
                .put(key.as_bytes(), value)
                .await
                .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?,
            None => self
                .db
                .delete(key.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?,
        };
        if is_watched(key) {
            let event_type = if value.is_some() {
                EventType::Put
            } else {
                EventType::Delete
            };
            self.event_log
                .emit(event_type, key.to_string(), value.map(<[u8]>::to_vec))
                .await;
        }
        Ok(())
    }

    /// Write `new` (delete when `None`) only if the stored bytes still equal
    /// `expected` (`None` meaning absent). Returns false on a mismatch.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> anyhow::Result<bool> {
        let _gate = self.write_gate.lock().await;
        let current = self.get(key).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        if current.as_deref() != new {
            self.write(key, new).await?;
        }
        Ok(true)
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    /// Delete a key from the store.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _gate = self.write_gate.lock().await;
        self.write(key, None).await
    }

    /// List all key-value pairs whose keys start with `prefix`, in key order.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        while let Some(kv) = iter
            .next()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan failed: {}", e))?
        {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    /// Fetch and decode a JSON object.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON object.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let data = serde_json::to_vec(value)?;
        self.put(key, &data).await
    }

    /// Optimistic read-modify-write of a JSON object.
    ///
    /// `f` sees the current object (or `None`) and decides what to write;
    /// its second return value is handed back to the caller. If another
    /// writer got in between the read and the write, `f` runs again on the
    /// fresh copy, so it must not have side effects.
    pub async fn mutate_json<T, R, F>(&self, key: &str, mut f: F) -> anyhow::Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> (Mutation<T>, R),
    {
        for attempt in 1..=MAX_MUTATE_ATTEMPTS {
            let current = self.get(key).await?;
            let decoded = match &current {
                Some(data) => Some(serde_json::from_slice(data)?),
                None => None,
            };
            let (mutation, result) = f(decoded);
            let new = match mutation {
                Mutation::Keep => return Ok(result),
                Mutation::Delete if current.is_none() => return Ok(result),
                Mutation::Delete => None,
                Mutation::Put(obj) => Some(serde_json::to_vec(&obj)?),
            };
            if self
                .compare_and_swap(key, current.as_deref(), new.as_deref())
                .await?
            {
                return Ok(result);
            }
            debug!("Conflict on {} (attempt {}), retrying", key, attempt);
        }
        anyhow::bail!(
            "{} kept changing, gave up after {} attempts",
            key,
            MAX_MUTATE_ATTEMPTS
        )
    }

    /// Decode every object under `prefix`. Entries that fail to decode are
    /// skipped with a warning.
    pub async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let entries = self.list_prefix(prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("Skipping undecodable entry {}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}
