use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::{
    chunk_store::{ChunkStore, ChunkStoreError},
    config::SweeperConfig,
    key_scheme::parse_chunk_key,
    merge_lock::MergeLocks,
    metrics::api_io_stats,
};

/// Removes chunks that were never merged.
///
/// A chunk is orphaned once it has gone unmodified for longer than the
/// configured max age. Each upload is swept under its merge lock so a merge
/// in progress never loses chunks underneath it.
pub struct Sweeper {
    chunks: ChunkStore,
    locks: MergeLocks,
    config: SweeperConfig,
    metrics: Arc<api_io_stats::Metrics>,
    shutdown_rx: watch::Receiver<()>,
}

impl Sweeper {
    pub fn new(
        chunks: ChunkStore,
        locks: MergeLocks,
        config: SweeperConfig,
        metrics: Arc<api_io_stats::Metrics>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            chunks,
            locks,
            config,
            metrics,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        info!(
            interval_secs = self.config.interval_secs,
            max_age_secs = self.config.max_age_secs,
            "starting chunk sweeper"
        );
        loop {
            if self.shutdown_rx.has_changed().unwrap_or(false) {
                info!("chunk sweeper shutting down");
                return Ok(());
            }
            if let Err(err) = self.sweep_once(SystemTime::now()).await {
                error!("chunk sweep failed: {:?}", err);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = self.shutdown_rx.changed() => {
                    info!("chunk sweeper shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Deletes chunks older than the max age as of `now`. Returns how many
    /// were removed.
    pub async fn sweep_once(&self, now: SystemTime) -> Result<usize> {
        let mut expired: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for meta in self.chunks.list_all().await? {
            if !self.is_expired(meta.last_modified, now) {
                continue;
            }
            let id = match parse_chunk_key(&meta.key) {
                Some((id, _)) => id.to_string(),
                None => {
                    debug!(key = %meta.key, "skipping unrecognized key in chunk namespace");
                    continue;
                }
            };
            expired.entry(id).or_default().push(meta.key);
        }

        let mut removed = 0;
        for (id, keys) in expired {
            let _guard = self.locks.acquire(&id).await;
            for key in keys {
                // Re-checked under the lock: the chunk may have been merged or
                // re-uploaded since the listing.
                match self.chunks.meta(&key).await {
                    Ok(meta) if self.is_expired(meta.last_modified, now) => {}
                    Ok(_) | Err(ChunkStoreError::NotFound { .. }) => continue,
                    Err(ChunkStoreError::Storage(err)) => {
                        error!(%key, "failed to inspect chunk: {:?}", err);
                        continue;
                    }
                }
                match self.chunks.delete_key(&key).await {
                    Ok(true) => {
                        debug!(%key, "swept orphaned chunk");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(err) => error!(%key, "failed to sweep chunk: {:?}", err),
                }
            }
        }

        if removed > 0 {
            info!(removed, "swept orphaned chunks");
            self.metrics.swept_chunks.add(removed as u64, &[]);
        }
        Ok(removed)
    }

    fn is_expired(&self, last_modified: SystemTime, now: SystemTime) -> bool {
        now.duration_since(last_modified)
            .map(|age| age > self.config.max_age())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blob_store::{BlobStorage, BlobStorageConfig};
    use bytes::Bytes;
    use futures::stream;

    use super::*;

    async fn setup(dir: &tempfile::TempDir) -> Result<ChunkStore> {
        let storage = BlobStorage::new(BlobStorageConfig::new(dir.path().to_str().unwrap()))?;
        let chunks = ChunkStore::new(Arc::new(storage));
        chunks.init().await?;
        for (id, index) in [("old", 0), ("old", 1), ("other", 0)] {
            chunks
                .put(id, index, stream::iter(vec![Ok(Bytes::from("x"))]))
                .await?;
        }
        Ok(chunks)
    }

    fn sweeper(chunks: ChunkStore, shutdown_rx: watch::Receiver<()>) -> Sweeper {
        let config = SweeperConfig {
            enabled: true,
            interval_secs: 3600,
            max_age_secs: 60,
        };
        Sweeper::new(
            chunks,
            MergeLocks::new(),
            config,
            Arc::new(api_io_stats::Metrics::new()),
            shutdown_rx,
        )
    }

    #[tokio::test]
    async fn test_fresh_chunks_survive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chunks = setup(&dir).await?;
        let (_tx, rx) = watch::channel(());
        let sweeper = sweeper(chunks.clone(), rx);

        assert_eq!(sweeper.sweep_once(SystemTime::now()).await?, 0);
        assert_eq!(chunks.list_all().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_chunks_are_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chunks = setup(&dir).await?;
        let (_tx, rx) = watch::channel(());
        let sweeper = sweeper(chunks.clone(), rx);

        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(sweeper.sweep_once(later).await?, 3);
        assert!(chunks.list_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chunks = setup(&dir).await?;
        let (tx, rx) = watch::channel(());
        let mut sweeper = sweeper(chunks, rx);

        let handle = tokio::spawn(async move { sweeper.start().await });
        tx.send(())?;
        tokio::time::timeout(Duration::from_secs(5), handle).await???;
        Ok(())
    }
}
