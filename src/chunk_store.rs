use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use blob_store::{is_not_found, BlobMeta, BlobObject, BlobStorage};
use bytes::Bytes;
use tracing::debug;

use crate::key_scheme::{chunk_key, parse_index};

/// Namespace holding in-flight chunks.
pub const CHUNKS_PREFIX: &str = "chunks";

#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("chunk not found: {key}")]
    NotFound { key: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub key: String,
    pub size_bytes: u64,
}

/// Durable chunk storage keyed by (upload identifier, index).
///
/// Nothing is cached; every call goes to the blob store. Writes are staged
/// and published atomically, so a reader never sees a partial chunk.
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<BlobStorage>,
}

impl ChunkStore {
    pub fn new(storage: Arc<BlobStorage>) -> Self {
        Self { storage }
    }

    pub async fn init(&self) -> Result<()> {
        self.storage.ensure_prefix(CHUNKS_PREFIX).await
    }

    fn storage_key(key: &str) -> String {
        format!("{}/{}", CHUNKS_PREFIX, key)
    }

    /// Stores a chunk, replacing whatever was at the same index.
    pub async fn put(
        &self,
        upload_id: &str,
        index: u64,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<StoredChunk> {
        let key = chunk_key(upload_id, index);
        let res = self.storage.put(&Self::storage_key(&key), data).await?;
        Ok(StoredChunk {
            key,
            size_bytes: res.size_bytes,
        })
    }

    #[cfg(test)]
    pub async fn exists(&self, upload_id: &str, index: u64) -> Result<bool> {
        let key = chunk_key(upload_id, index);
        self.storage.exists(&Self::storage_key(&key)).await
    }

    pub async fn open(&self, upload_id: &str, index: u64) -> Result<BlobObject, ChunkStoreError> {
        self.open_key(&chunk_key(upload_id, index)).await
    }

    /// Opens a chunk by its full key, as returned from [`ChunkStore::put`].
    pub async fn open_key(&self, key: &str) -> Result<BlobObject, ChunkStoreError> {
        self.storage
            .open(&Self::storage_key(key))
            .await
            .map(|object| BlobObject {
                meta: BlobMeta {
                    key: key.to_string(),
                    ..object.meta
                },
                body: object.body,
            })
            .map_err(|err| not_found_or(key, err))
    }

    #[cfg(test)]
    pub async fn read(&self, upload_id: &str, index: u64) -> Result<Bytes, ChunkStoreError> {
        let key = chunk_key(upload_id, index);
        self.storage
            .read_bytes(&Self::storage_key(&key))
            .await
            .map_err(|err| not_found_or(&key, err))
    }

    pub async fn meta(&self, key: &str) -> Result<BlobMeta, ChunkStoreError> {
        self.storage
            .head(&Self::storage_key(key))
            .await
            .map(|meta| BlobMeta {
                key: key.to_string(),
                ..meta
            })
            .map_err(|err| not_found_or(key, err))
    }

    /// Removes a chunk. Returns false if it was already gone.
    #[cfg(test)]
    pub async fn delete(&self, upload_id: &str, index: u64) -> Result<bool> {
        self.delete_key(&chunk_key(upload_id, index)).await
    }

    /// Removes a chunk only if it is still the version described by `seen`.
    /// A chunk re-uploaded since then is left in place.
    pub async fn delete_if_unchanged(
        &self,
        upload_id: &str,
        index: u64,
        seen: &BlobMeta,
    ) -> Result<bool> {
        let key = chunk_key(upload_id, index);
        let current = match self.meta(&key).await {
            Ok(meta) => meta,
            Err(ChunkStoreError::NotFound { .. }) => return Ok(false),
            Err(ChunkStoreError::Storage(err)) => return Err(err),
        };
        if !current.same_version(seen) {
            debug!(%key, "chunk replaced since it was read, keeping it");
            return Ok(false);
        }
        self.delete_key(&key).await
    }

    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        let deleted = self.storage.delete(&Self::storage_key(key)).await?;
        if !deleted {
            debug!(key, "chunk already absent on delete");
        }
        Ok(deleted)
    }

    /// Indices currently stored for `upload_id`.
    pub async fn list_indices(&self, upload_id: &str) -> Result<BTreeSet<u64>> {
        Ok(self
            .list_all()
            .await?
            .iter()
            .filter_map(|meta| parse_index(upload_id, &meta.key))
            .collect())
    }

    /// Every stored chunk, with keys relative to the chunk namespace.
    pub async fn list_all(&self) -> Result<Vec<BlobMeta>> {
        let prefix = format!("{}/", CHUNKS_PREFIX);
        Ok(self
            .storage
            .list(CHUNKS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|meta| {
                let key = meta.key.strip_prefix(&prefix)?.to_string();
                // Only flat keys belong to this namespace.
                (!key.contains('/')).then_some(BlobMeta { key, ..meta })
            })
            .collect())
    }

    /// Indices in `[0, total)` absent from `present`, ascending.
    pub fn missing_indices(present: &BTreeSet<u64>, total: u64) -> Vec<u64> {
        (0..total).filter(|index| !present.contains(index)).collect()
    }
}

fn not_found_or(key: &str, err: anyhow::Error) -> ChunkStoreError {
    if is_not_found(&err) {
        ChunkStoreError::NotFound {
            key: key.to_string(),
        }
    } else {
        ChunkStoreError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use blob_store::BlobStorageConfig;
    use futures::stream;

    use super::*;

    fn payload(data: &'static str) -> impl futures::Stream<Item = Result<Bytes>> + Send + Unpin {
        stream::iter(vec![Ok(Bytes::from(data))])
    }

    async fn chunk_store(dir: &tempfile::TempDir) -> Result<ChunkStore> {
        let storage = BlobStorage::new(BlobStorageConfig::new(dir.path().to_str().unwrap()))?;
        let store = ChunkStore::new(Arc::new(storage));
        store.init().await?;
        Ok(store)
    }

    #[tokio::test]
    async fn test_put_replaces_previous_payload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = chunk_store(&dir).await?;

        let stored = store.put("abc", 0, payload("first")).await?;
        assert_eq!(stored.key, "abc-chunk-0");
        assert_eq!(stored.size_bytes, 5);
        store.put("abc", 0, payload("second")).await?;

        assert!(store.exists("abc", 0).await?);
        assert_eq!(store.read("abc", 0).await?, Bytes::from("second"));
        assert_eq!(store.meta("abc-chunk-0").await?.size_bytes, 6);
        assert!(dir.path().join("chunks").join("abc-chunk-0").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_and_delete_missing_chunk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = chunk_store(&dir).await?;

        assert!(!store.exists("abc", 3).await?);
        assert!(matches!(
            store.read("abc", 3).await,
            Err(ChunkStoreError::NotFound { .. })
        ));
        assert!(!store.delete("abc", 3).await?);

        store.put("abc", 3, payload("x")).await?;
        assert!(store.delete("abc", 3).await?);
        assert!(!store.exists("abc", 3).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_indices_is_scoped_to_upload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = chunk_store(&dir).await?;

        for index in [2, 0, 5] {
            store.put("abc", index, payload("x")).await?;
        }
        store.put("abcd", 1, payload("x")).await?;
        store.put("abc-chunk-9", 4, payload("x")).await?;

        let indices = store.list_indices("abc").await?;
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![0, 2, 5]);
        assert_eq!(store.list_all().await?.len(), 5);
        assert!(store.list_indices("nothing").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_replaced_chunk_survives_conditional_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = chunk_store(&dir).await?;

        store.put("abc", 0, payload("old")).await?;
        let seen = store.open("abc", 0).await?.meta;
        assert_eq!(seen.key, "abc-chunk-0");

        store.put("abc", 0, payload("newer")).await?;
        assert!(!store.delete_if_unchanged("abc", 0, &seen).await?);
        assert_eq!(store.read("abc", 0).await?, Bytes::from("newer"));

        let seen = store.open("abc", 0).await?.meta;
        assert!(store.delete_if_unchanged("abc", 0, &seen).await?);
        assert!(!store.exists("abc", 0).await?);
        assert!(!store.delete_if_unchanged("abc", 0, &seen).await?);
        Ok(())
    }

    #[test]
    fn test_missing_indices() {
        let present: BTreeSet<u64> = [0, 2, 7].into_iter().collect();
        assert_eq!(ChunkStore::missing_indices(&present, 4), vec![1, 3]);
        assert!(ChunkStore::missing_indices(&present, 0).is_empty());
        assert!(ChunkStore::missing_indices(&present, 1).is_empty());
    }
}
