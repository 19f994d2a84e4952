use std::{collections::BTreeSet, sync::Arc};

use blob_store::{BlobMeta, BlobWriter};
use futures::StreamExt;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::{
    artifact_store::ArtifactStore,
    chunk_store::{ChunkStore, ChunkStoreError},
    config::MergeConfig,
    key_scheme::chunk_key,
    merge_lock::MergeLocks,
    metrics::{api_io_stats, Timer},
};

#[derive(Debug, Clone)]
pub struct MergeSpec {
    /// Identifier the chunks were ingested under.
    pub upload_id: String,
    /// Name of the artifact to produce.
    pub file_name: String,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub file_url: String,
    pub size_bytes: u64,
    pub merged_chunks: u64,
    /// Indices skipped in lenient mode. Always empty in strict mode.
    pub missing_indices: Vec<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("missing chunks: {0:?}")]
    MissingChunks(Vec<u64>),

    #[error("invalid merge request: {0}")]
    InvalidRequest(String),

    #[error("failed to read chunks: {0:#}")]
    Storage(anyhow::Error),

    #[error("failed to write merged artifact: {0:#}")]
    Output(anyhow::Error),
}

impl MergeError {
    pub fn kind(&self) -> &'static str {
        match self {
            MergeError::MissingChunks(_) => "missing_chunks",
            MergeError::InvalidRequest(_) => "invalid_request",
            MergeError::Storage(_) => "storage",
            MergeError::Output(_) => "output",
        }
    }
}

#[derive(Default)]
struct MergeProgress {
    /// Appended chunks, with the version that was read.
    included: Vec<(u64, BlobMeta)>,
    missing: Vec<u64>,
}

/// Concatenates an upload's chunks, in index order, into one artifact.
///
/// Merges of the same upload run one at a time. The artifact is published
/// under its final name only once every byte is written; consumed chunks
/// are deleted only after that, so a failed merge can simply be retried.
pub struct ReassemblyEngine {
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    locks: MergeLocks,
    strict: bool,
    max_total_chunks: u64,
    metrics: Arc<api_io_stats::Metrics>,
}

impl ReassemblyEngine {
    pub fn new(
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        locks: MergeLocks,
        config: &MergeConfig,
        metrics: Arc<api_io_stats::Metrics>,
    ) -> Self {
        Self {
            chunks,
            artifacts,
            locks,
            strict: config.strict,
            max_total_chunks: config.max_total_chunks,
            metrics,
        }
    }

    pub async fn merge(&self, request: &MergeSpec) -> Result<MergeOutcome, MergeError> {
        let _timer = Timer::start(&self.metrics.merge_duration);
        let result = self.merge_serialized(request).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        self.metrics
            .merges
            .add(1, &[KeyValue::new("outcome", outcome)]);
        result
    }

    async fn merge_serialized(&self, request: &MergeSpec) -> Result<MergeOutcome, MergeError> {
        if request.total_chunks > self.max_total_chunks {
            return Err(MergeError::InvalidRequest(format!(
                "totalChunks {} exceeds the limit of {}",
                request.total_chunks, self.max_total_chunks
            )));
        }

        let _guard = self.locks.acquire(&request.upload_id).await;

        let present = self
            .chunks
            .list_indices(&request.upload_id)
            .await
            .map_err(MergeError::Storage)?;
        let missing = ChunkStore::missing_indices(&present, request.total_chunks);
        if !missing.is_empty() {
            self.metrics.missing_chunks.add(missing.len() as u64, &[]);
            if self.strict {
                warn!(
                    upload_id = %request.upload_id,
                    file_name = %request.file_name,
                    missing = ?missing,
                    "refusing to merge incomplete upload"
                );
                return Err(MergeError::MissingChunks(missing));
            }
        }

        info!(
            upload_id = %request.upload_id,
            file_name = %request.file_name,
            total_chunks = request.total_chunks,
            "merging chunks"
        );

        let mut writer = self
            .artifacts
            .writer(&request.file_name)
            .await
            .map_err(MergeError::Output)?;
        let mut progress = MergeProgress {
            included: vec![],
            missing,
        };
        if let Err(err) = self
            .append_chunks(&mut writer, request, &present, &mut progress)
            .await
        {
            if let Err(abort_err) = writer.abort().await {
                warn!(
                    file_name = %request.file_name,
                    "failed to abort merged artifact: {:?}", abort_err
                );
            }
            return Err(err);
        }
        let put = writer.finish().await.map_err(MergeError::Output)?;

        for (index, seen) in &progress.included {
            match self
                .chunks
                .delete_if_unchanged(&request.upload_id, *index, seen)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(
                    upload_id = %request.upload_id,
                    index,
                    "merged chunk already gone or replaced"
                ),
                Err(err) => warn!(
                    upload_id = %request.upload_id,
                    index,
                    "failed to delete merged chunk: {:?}", err
                ),
            }
        }

        let MergeProgress {
            included,
            mut missing,
        } = progress;
        missing.sort_unstable();
        info!(
            upload_id = %request.upload_id,
            file_name = %request.file_name,
            size_bytes = put.size_bytes,
            merged_chunks = included.len(),
            missing_chunks = missing.len(),
            "merge complete"
        );
        Ok(MergeOutcome {
            file_url: ArtifactStore::public_url(&request.file_name),
            size_bytes: put.size_bytes,
            merged_chunks: included.len() as u64,
            missing_indices: missing,
        })
    }

    async fn append_chunks(
        &self,
        writer: &mut BlobWriter,
        request: &MergeSpec,
        present: &BTreeSet<u64>,
        progress: &mut MergeProgress,
    ) -> Result<(), MergeError> {
        for index in 0..request.total_chunks {
            if !present.contains(&index) {
                warn!(
                    upload_id = %request.upload_id,
                    key = %chunk_key(&request.upload_id, index),
                    "missing chunk"
                );
                continue;
            }
            let mut chunk = match self.chunks.open(&request.upload_id, index).await {
                Ok(chunk) => chunk,
                Err(ChunkStoreError::NotFound { key }) => {
                    self.metrics.missing_chunks.add(1, &[]);
                    if self.strict {
                        return Err(MergeError::MissingChunks(vec![index]));
                    }
                    warn!(upload_id = %request.upload_id, %key, "chunk vanished before merge");
                    progress.missing.push(index);
                    continue;
                }
                Err(ChunkStoreError::Storage(err)) => return Err(MergeError::Storage(err)),
            };
            while let Some(bytes) = chunk.body.next().await {
                let bytes = bytes.map_err(MergeError::Storage)?;
                writer.write(bytes).await.map_err(MergeError::Output)?;
            }
            debug!(upload_id = %request.upload_id, index, "appended chunk");
            progress.included.push((index, chunk.meta));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use blob_store::{BlobStorage, BlobStorageConfig};
    use bytes::Bytes;
    use futures::stream;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        locks: MergeLocks,
    }

    impl Fixture {
        async fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let storage = Arc::new(BlobStorage::new(BlobStorageConfig::new(
                dir.path().to_str().unwrap(),
            ))?);
            let chunks = ChunkStore::new(storage.clone());
            let artifacts = ArtifactStore::new(storage);
            chunks.init().await?;
            artifacts.init().await?;
            Ok(Self {
                _dir: dir,
                chunks,
                artifacts,
                locks: MergeLocks::new(),
            })
        }

        fn engine(&self, strict: bool) -> ReassemblyEngine {
            let config = MergeConfig {
                strict,
                max_total_chunks: 1000,
            };
            ReassemblyEngine::new(
                self.chunks.clone(),
                self.artifacts.clone(),
                self.locks.clone(),
                &config,
                Arc::new(api_io_stats::Metrics::new()),
            )
        }

        async fn upload(&self, upload_id: &str, index: u64, data: &'static [u8]) -> Result<()> {
            self.chunks
                .put(upload_id, index, stream::iter(vec![Ok(Bytes::from(data))]))
                .await?;
            Ok(())
        }
    }

    fn merge_spec(upload_id: &str, file_name: &str, total_chunks: u64) -> MergeSpec {
        MergeSpec {
            upload_id: upload_id.to_string(),
            file_name: file_name.to_string(),
            total_chunks,
        }
    }

    #[tokio::test]
    async fn test_out_of_order_upload_merges_in_index_order() -> Result<()> {
        let f = Fixture::new().await?;
        f.upload("abc", 2, b"CCCCC").await?;
        f.upload("abc", 0, b"AAAAA").await?;
        f.upload("abc", 1, b"BBBBB").await?;

        let outcome = f.engine(true).merge(&merge_spec("abc", "out.bin", 3)).await?;
        assert_eq!(outcome.file_url, "/uploads/merged/out.bin");
        assert_eq!(outcome.size_bytes, 15);
        assert_eq!(outcome.merged_chunks, 3);
        assert!(outcome.missing_indices.is_empty());
        assert_eq!(
            f.artifacts.read_bytes("out.bin").await?,
            Bytes::from("AAAAABBBBBCCCCC")
        );
        for index in 0..3 {
            assert!(!f.chunks.exists("abc", index).await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_lenient_merge_skips_missing_chunk() -> Result<()> {
        let f = Fixture::new().await?;
        f.upload("xyz", 0, b"00000").await?;
        f.upload("xyz", 2, b"22222").await?;

        let outcome = f.engine(false).merge(&merge_spec("xyz", "xyz.bin", 3)).await?;
        assert_eq!(outcome.size_bytes, 10);
        assert_eq!(outcome.merged_chunks, 2);
        assert_eq!(outcome.missing_indices, vec![1]);
        assert_eq!(
            f.artifacts.read_bytes("xyz.bin").await?,
            Bytes::from("0000022222")
        );
        assert!(f.chunks.list_indices("xyz").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_strict_merge_fails_without_side_effects() -> Result<()> {
        let f = Fixture::new().await?;
        f.upload("xyz", 0, b"00000").await?;
        f.upload("xyz", 2, b"22222").await?;

        let err = f
            .engine(true)
            .merge(&merge_spec("xyz", "xyz.bin", 4))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::MissingChunks(ref missing) if missing == &vec![1, 3]));
        assert_eq!(err.kind(), "missing_chunks");
        assert!(f.artifacts.head("xyz.bin").await?.is_none());
        assert_eq!(
            f.chunks.list_indices("xyz").await?.into_iter().collect::<Vec<_>>(),
            vec![0, 2]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reupload_before_merge_wins() -> Result<()> {
        let f = Fixture::new().await?;
        f.upload("abc", 0, b"old").await?;
        f.upload("abc", 1, b"-tail").await?;
        f.upload("abc", 0, b"new").await?;

        f.engine(true).merge(&merge_spec("abc", "abc.txt", 2)).await?;
        assert_eq!(
            f.artifacts.read_bytes("abc.txt").await?,
            Bytes::from("new-tail")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_chunks_beyond_total_are_left_alone() -> Result<()> {
        let f = Fixture::new().await?;
        f.upload("abc", 0, b"a").await?;
        f.upload("abc", 1, b"b").await?;
        f.upload("abc", 5, b"z").await?;

        let outcome = f.engine(true).merge(&merge_spec("abc", "abc.txt", 2)).await?;
        assert_eq!(outcome.size_bytes, 2);
        assert_eq!(
            f.chunks.list_indices("abc").await?.into_iter().collect::<Vec<_>>(),
            vec![5]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_chunks_produces_empty_artifact() -> Result<()> {
        let f = Fixture::new().await?;
        let outcome = f.engine(true).merge(&merge_spec("none", "empty.bin", 0)).await?;
        assert_eq!(outcome.size_bytes, 0);
        assert_eq!(f.artifacts.read_bytes("empty.bin").await?, Bytes::new());
        Ok(())
    }

    #[tokio::test]
    async fn test_remerge_overwrites_artifact() -> Result<()> {
        let f = Fixture::new().await?;
        let engine = f.engine(true);
        f.upload("one", 0, b"first version").await?;
        engine.merge(&merge_spec("one", "doc.txt", 1)).await?;
        f.upload("two", 0, b"second").await?;
        engine.merge(&merge_spec("two", "doc.txt", 1)).await?;

        assert_eq!(f.artifacts.read_bytes("doc.txt").await?, Bytes::from("second"));
        Ok(())
    }

    #[tokio::test]
    async fn test_total_chunks_limit() -> Result<()> {
        let f = Fixture::new().await?;
        let err = f
            .engine(false)
            .merge(&merge_spec("abc", "abc.bin", 1001))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidRequest(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_merges_of_different_uploads() -> Result<()> {
        let f = Fixture::new().await?;
        for index in 0..4 {
            f.upload("left", index, b"L").await?;
            f.upload("right", index, b"R").await?;
        }
        let engine = f.engine(true);

        let left_spec = merge_spec("left", "left.bin", 4);
        let right_spec = merge_spec("right", "right.bin", 4);
        let (left, right) = tokio::join!(engine.merge(&left_spec), engine.merge(&right_spec));
        assert_eq!(left?.size_bytes, 4);
        assert_eq!(right?.size_bytes, 4);
        assert_eq!(f.artifacts.read_bytes("left.bin").await?, Bytes::from("LLLL"));
        assert_eq!(f.artifacts.read_bytes("right.bin").await?, Bytes::from("RRRR"));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_merges_of_same_upload_are_serialized() -> Result<()> {
        let f = Fixture::new().await?;
        for (index, data) in [(0, b"ab"), (1, b"cd"), (2, b"ef")] {
            f.upload("dup", index, data).await?;
        }
        let engine = Arc::new(f.engine(true));

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.merge(&merge_spec("dup", "first.bin", 3)).await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.merge(&merge_spec("dup", "second.bin", 3)).await }
        });
        let results = [first.await?, second.await?];

        let succeeded: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].size_bytes, 6);
        let failed: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert!(matches!(failed[0], MergeError::MissingChunks(missing) if missing == &vec![0, 1, 2]));
        Ok(())
    }
}
