//! Asset cache store.
//!
//! A store holds any number of named generations, each a map from
//! `RequestKey` to an immutable `ResponseSnapshot`. `MemoryStore` lives
//! here; the persistent filesystem backend is `infra::fs_store::FileStore`.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::keys::{GenerationId, RequestKey};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Captured response: status, headers and body at insertion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("generation `{0}` has not been opened")]
    MissingGeneration(GenerationId),
    #[error("store i/o failed during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store entry at `{path}`: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    pub fn corrupt(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Persistence seam for cache generations.
///
/// Implementations must tolerate concurrent readers and writers, including
/// other processes sharing the same backing storage.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Create the generation if absent. Existing entries are kept.
    async fn open_or_create(&self, generation: &GenerationId) -> Result<(), StoreError>;

    /// Insert every entry into an opened generation, replacing entries with
    /// the same key. Either all entries become visible or none do.
    async fn insert_all(
        &self,
        generation: &GenerationId,
        entries: Vec<(RequestKey, ResponseSnapshot)>,
    ) -> Result<(), StoreError>;

    /// Exact-key lookup. A missing generation is a miss.
    async fn lookup(
        &self,
        generation: &GenerationId,
        key: &RequestKey,
    ) -> Result<Option<ResponseSnapshot>, StoreError>;

    async fn list_generations(&self) -> Result<Vec<GenerationId>, StoreError>;

    /// Remove a generation. Returns `false` when it did not exist.
    async fn delete(&self, generation: &GenerationId) -> Result<bool, StoreError>;

    /// Number of entries in a generation, `None` when it does not exist.
    async fn entry_count(&self, generation: &GenerationId) -> Result<Option<usize>, StoreError>;
}

/// In-process store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    generations: RwLock<BTreeMap<GenerationId, HashMap<RequestKey, ResponseSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn open_or_create(&self, generation: &GenerationId) -> Result<(), StoreError> {
        rw_write(&self.generations, SOURCE, "open_or_create")
            .entry(generation.clone())
            .or_default();
        Ok(())
    }

    async fn insert_all(
        &self,
        generation: &GenerationId,
        entries: Vec<(RequestKey, ResponseSnapshot)>,
    ) -> Result<(), StoreError> {
        let mut generations = rw_write(&self.generations, SOURCE, "insert_all");
        let Some(map) = generations.get_mut(generation) else {
            return Err(StoreError::MissingGeneration(generation.clone()));
        };
        map.extend(entries);
        Ok(())
    }

    async fn lookup(
        &self,
        generation: &GenerationId,
        key: &RequestKey,
    ) -> Result<Option<ResponseSnapshot>, StoreError> {
        Ok(rw_read(&self.generations, SOURCE, "lookup")
            .get(generation)
            .and_then(|map| map.get(key))
            .cloned())
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>, StoreError> {
        Ok(rw_read(&self.generations, SOURCE, "list_generations")
            .keys()
            .cloned()
            .collect())
    }

    async fn delete(&self, generation: &GenerationId) -> Result<bool, StoreError> {
        Ok(rw_write(&self.generations, SOURCE, "delete")
            .remove(generation)
            .is_some())
    }

    async fn entry_count(&self, generation: &GenerationId) -> Result<Option<usize>, StoreError> {
        Ok(rw_read(&self.generations, SOURCE, "entry_count")
            .get(generation)
            .map(HashMap::len))
    }
}
