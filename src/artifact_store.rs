use std::sync::Arc;

use anyhow::Result;
use blob_store::{BlobObject, BlobStorage, BlobWriter};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Namespace holding finished artifacts, keyed by file name.
pub const MERGED_PREFIX: &str = "merged";

/// Public path merged artifacts are served under.
pub const PUBLIC_MERGED_PATH: &str = "/uploads/merged";

/// Bytes escaped when a file name becomes a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<BlobStorage>,
}

impl ArtifactStore {
    pub fn new(storage: Arc<BlobStorage>) -> Self {
        Self { storage }
    }

    pub async fn init(&self) -> Result<()> {
        self.storage.ensure_prefix(MERGED_PREFIX).await
    }

    fn storage_key(file_name: &str) -> String {
        format!("{}/{}", MERGED_PREFIX, file_name)
    }

    /// Opens an output sink for `file_name`. The previous artifact, if any,
    /// stays readable until the new one is finished.
    pub async fn writer(&self, file_name: &str) -> Result<BlobWriter> {
        self.storage.writer(&Self::storage_key(file_name)).await
    }

    #[cfg(test)]
    pub async fn head(&self, file_name: &str) -> Result<Option<blob_store::BlobMeta>> {
        match self.storage.head(&Self::storage_key(file_name)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if blob_store::is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn open(&self, file_name: &str) -> Result<BlobObject> {
        self.storage.open(&Self::storage_key(file_name)).await
    }

    #[cfg(test)]
    pub async fn read_bytes(&self, file_name: &str) -> Result<bytes::Bytes> {
        self.storage.read_bytes(&Self::storage_key(file_name)).await
    }

    /// Path a client fetches `file_name` from, escaped as one path segment.
    pub fn public_url(file_name: &str) -> String {
        format!(
            "{}/{}",
            PUBLIC_MERGED_PATH,
            utf8_percent_encode(file_name, PATH_SEGMENT)
        )
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_artifact_visible_only_after_finish() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(blob_store::BlobStorageConfig::new(
            dir.path().to_str().unwrap(),
        ))?;
        let artifacts = ArtifactStore::new(Arc::new(storage));
        artifacts.init().await?;

        let mut writer = artifacts.writer("report.pdf").await?;
        writer.write(Bytes::from("%PDF")).await?;
        assert!(artifacts.head("report.pdf").await?.is_none());

        let put = writer.finish().await?;
        assert_eq!(put.size_bytes, 4);
        let meta = artifacts.head("report.pdf").await?.unwrap();
        assert_eq!(meta.size_bytes, 4);
        assert_eq!(artifacts.read_bytes("report.pdf").await?, Bytes::from("%PDF"));
        assert_eq!(
            ArtifactStore::public_url("report.pdf"),
            "/uploads/merged/report.pdf"
        );
        Ok(())
    }

    #[test]
    fn test_public_url_escapes_path_segment() {
        assert_eq!(
            ArtifactStore::public_url("clip #1.mp4"),
            "/uploads/merged/clip%20%231.mp4"
        );
        assert_eq!(ArtifactStore::public_url("q?x.bin"), "/uploads/merged/q%3Fx.bin");
        assert_eq!(ArtifactStore::public_url("50%.bin"), "/uploads/merged/50%25.bin");
        assert_eq!(
            ArtifactStore::public_url("résumé.pdf"),
            "/uploads/merged/r%C3%A9sum%C3%A9.pdf"
        );
    }
}
