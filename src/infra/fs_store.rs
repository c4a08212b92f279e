//! Filesystem-backed asset store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <generation>/index.json        request key -> entry metadata
//! <generation>/blobs/<sha256>    response bodies, content addressed
//! ```
//!
//! Blobs are written before the index, and the index is replaced through a
//! temporary file plus rename, so readers in other processes see either the
//! previous or the new set of entries. Deleting a generation first renames
//! its directory to a hidden trash name, which removes it from listings in a
//! single step.
//!
//! Parsed indexes are kept in memory per generation and reused while the
//! file on disk keeps the same modification time, length and inode.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{AssetStore, GenerationId, RequestKey, ResponseSnapshot, StoreError};

const SOURCE: &str = "pantry::infra::fs_store";
const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";

#[derive(Debug, Default, Serialize, Deserialize)]
struct GenerationIndex {
    entries: BTreeMap<String, StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    status: u16,
    headers: Vec<(String, String)>,
    blob: String,
    #[serde(with = "time::serde::timestamp")]
    stored_at: OffsetDateTime,
}

/// Changes whenever any writer replaces an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexStamp {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl IndexStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(metadata),
        }
    }
}

#[derive(Debug)]
struct CachedIndex {
    stamp: IndexStamp,
    index: Arc<GenerationIndex>,
}

/// Asset store persisted under a root directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    indexes: RwLock<HashMap<GenerationId, CachedIndex>>,
}

impl FileStore {
    /// Open the store rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            indexes: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &GenerationId) -> PathBuf {
        self.root.join(generation.as_str())
    }

    fn index_path(&self, generation: &GenerationId) -> PathBuf {
        self.generation_dir(generation).join(INDEX_FILE)
    }

    async fn read_index(
        &self,
        generation: &GenerationId,
    ) -> Result<Option<GenerationIndex>, StoreError> {
        let path = self.index_path(generation);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io("read_index", err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::corrupt(path.display().to_string(), err.to_string()))
    }

    async fn write_index(
        &self,
        generation: &GenerationId,
        index: &GenerationIndex,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(index)
            .map_err(|err| StoreError::backend(format!("failed to encode index: {err}")))?;
        let result = write_atomic(&self.index_path(generation), &encoded).await;
        self.forget_index(generation);
        result
    }

    /// Parsed index for `generation`, re-read only when the file changed.
    async fn cached_index(
        &self,
        generation: &GenerationId,
    ) -> Result<Option<Arc<GenerationIndex>>, StoreError> {
        let stamp = match fs::metadata(self.index_path(generation)).await {
            Ok(metadata) => IndexStamp::of(&metadata),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget_index(generation);
                return Ok(None);
            }
            Err(err) => return Err(StoreError::io("cached_index.metadata", err)),
        };

        let fresh = rw_read(&self.indexes, SOURCE, "cached_index")
            .get(generation)
            .filter(|cached| cached.stamp == stamp)
            .map(|cached| Arc::clone(&cached.index));
        if fresh.is_some() {
            return Ok(fresh);
        }

        // Stamped before reading: a concurrent replace only costs a re-read.
        let Some(index) = self.read_index(generation).await? else {
            self.forget_index(generation);
            return Ok(None);
        };
        let index = Arc::new(index);
        rw_write(&self.indexes, SOURCE, "cached_index").insert(
            generation.clone(),
            CachedIndex {
                stamp,
                index: Arc::clone(&index),
            },
        );
        Ok(Some(index))
    }

    fn forget_index(&self, generation: &GenerationId) {
        rw_write(&self.indexes, SOURCE, "forget_index").remove(generation);
    }
}

#[async_trait]
impl AssetStore for FileStore {
    async fn open_or_create(&self, generation: &GenerationId) -> Result<(), StoreError> {
        let dir = self.generation_dir(generation);
        fs::create_dir_all(dir.join(BLOB_DIR))
            .await
            .map_err(|err| StoreError::io("open_or_create", err))?;
        if self.cached_index(generation).await?.is_none() {
            self.write_index(generation, &GenerationIndex::default())
                .await?;
            debug!(generation = %generation, root = %self.root.display(), "created generation");
        }
        Ok(())
    }

    async fn insert_all(
        &self,
        generation: &GenerationId,
        entries: Vec<(RequestKey, ResponseSnapshot)>,
    ) -> Result<(), StoreError> {
        let Some(mut index) = self.read_index(generation).await? else {
            return Err(StoreError::MissingGeneration(generation.clone()));
        };

        let blob_dir = self.generation_dir(generation).join(BLOB_DIR);
        let stored_at = OffsetDateTime::now_utc();
        for (key, snapshot) in entries {
            let blob = blob_name(&snapshot.body);
            let blob_path = blob_dir.join(&blob);
            if fs::try_exists(&blob_path)
                .await
                .map_err(|err| StoreError::io("insert_all.blob_exists", err))?
            {
                debug!(blob = %blob, "blob already stored");
            } else {
                write_atomic(&blob_path, &snapshot.body).await?;
            }

            index.entries.insert(
                key.to_string(),
                StoredEntry {
                    status: snapshot.status,
                    headers: snapshot.headers,
                    blob,
                    stored_at,
                },
            );
        }

        self.write_index(generation, &index).await
    }

    async fn lookup(
        &self,
        generation: &GenerationId,
        key: &RequestKey,
    ) -> Result<Option<ResponseSnapshot>, StoreError> {
        let Some(index) = self.cached_index(generation).await? else {
            return Ok(None);
        };
        let Some(entry) = index.entries.get(&key.to_string()) else {
            return Ok(None);
        };

        let blob_path = self
            .generation_dir(generation)
            .join(BLOB_DIR)
            .join(&entry.blob);
        let body = match fs::read(&blob_path).await {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::corrupt(
                    blob_path.display().to_string(),
                    "indexed blob is missing",
                ));
            }
            Err(err) => return Err(StoreError::io("lookup.blob", err)),
        };

        Ok(Some(ResponseSnapshot::new(
            entry.status,
            entry.headers.clone(),
            Bytes::from(body),
        )))
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io("list_generations", err)),
        };

        let mut generations = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| StoreError::io("list_generations.next_entry", err))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|err| StoreError::io("list_generations.file_type", err))?
                .is_dir();
            if !is_dir {
                continue;
            }
            // Trash and temporary directories never parse as generation ids.
            let Some(generation) = entry
                .file_name()
                .to_str()
                .and_then(|name| GenerationId::new(name).ok())
            else {
                continue;
            };
            if fs::try_exists(entry.path().join(INDEX_FILE))
                .await
                .map_err(|err| StoreError::io("list_generations.index_exists", err))?
            {
                generations.push(generation);
            }
        }
        generations.sort();
        Ok(generations)
    }

    async fn delete(&self, generation: &GenerationId) -> Result<bool, StoreError> {
        let dir = self.generation_dir(generation);
        let trash = self.root.join(format!(".trash-{}", Uuid::new_v4()));
        let renamed = fs::rename(&dir, &trash).await;
        self.forget_index(generation);
        match renamed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::io("delete.rename", err)),
        }

        if let Err(err) = fs::remove_dir_all(&trash).await {
            warn!(
                generation = %generation,
                trash = %trash.display(),
                error = %err,
                "generation unlinked but trash directory could not be removed"
            );
        }
        Ok(true)
    }

    async fn entry_count(&self, generation: &GenerationId) -> Result<Option<usize>, StoreError> {
        Ok(self
            .cached_index(generation)
            .await?
            .map(|index| index.entries.len()))
    }
}

fn blob_name(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", Uuid::new_v4()));

    fs::write(&tmp, bytes)
        .await
        .map_err(|err| StoreError::io("write_atomic.write", err))?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::io("write_atomic.rename", err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached_generations(store: &FileStore) -> usize {
        rw_read(&store.indexes, SOURCE, "test").len()
    }

    #[tokio::test]
    async fn parsed_index_is_reused_until_the_generation_goes_away() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("open store");
        let v1 = GenerationId::new("lakshmi-dairy-v1").expect("valid generation");
        let origin = url::Url::parse("https://dairy.example/").expect("valid origin");
        let key = RequestKey::get(&origin, "/index.html").expect("valid key");

        store.open_or_create(&v1).await.expect("open generation");
        store
            .insert_all(
                &v1,
                vec![(key.clone(), ResponseSnapshot::new(200, Vec::new(), "shell"))],
            )
            .await
            .expect("insert");
        assert_eq!(cached_generations(&store), 0);

        store.lookup(&v1, &key).await.expect("lookup").expect("entry");
        let first = store.cached_index(&v1).await.expect("index").expect("stored");
        let second = store.cached_index(&v1).await.expect("index").expect("stored");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cached_generations(&store), 1);

        assert!(store.delete(&v1).await.expect("delete"));
        assert_eq!(cached_generations(&store), 0);
        assert_eq!(store.lookup(&v1, &key).await.expect("lookup"), None);
    }

    #[test]
    fn blob_names_are_content_addressed() {
        assert_eq!(blob_name(b"milk"), blob_name(b"milk"));
        assert_ne!(blob_name(b"milk"), blob_name(b"curd"));
        assert_eq!(blob_name(b"").len(), 64);
    }
}
