use std::{env, fmt::Debug, path::PathBuf, sync::Arc, time::SystemTime};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

/// Parts that may be in flight for a single multipart write.
const MAX_INFLIGHT_PARTS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default = "default_blob_store_path")]
    pub path: String,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            path: default_blob_store_path(),
        }
    }
}

fn default_blob_store_path() -> String {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    format!("file://{}", cwd.join("chunkyard_storage").display())
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Listing entry, keyed relative to the storage root.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: SystemTime,
    pub e_tag: Option<String>,
}

impl BlobMeta {
    /// True when both describe the same stored version of an object.
    pub fn same_version(&self, other: &BlobMeta) -> bool {
        match (&self.e_tag, &other.e_tag) {
            (Some(a), Some(b)) => a == b,
            _ => self.size_bytes == other.size_bytes && self.last_modified == other.last_modified,
        }
    }
}

/// An object opened for reading, with the metadata of the version the body
/// streams.
pub struct BlobObject {
    pub meta: BlobMeta,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Returns true when the error chain bottoms out in a missing object.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<object_store::Error>(),
        Some(object_store::Error::NotFound { .. })
    )
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    local_root: Option<PathBuf>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("path", &self.path)
            .field("local_root", &self.local_root)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .parse::<Url>()
            .with_context(|| format!("invalid blob store url: {}", config.path))?;
        let (scheme, _) = ObjectStoreScheme::parse(&url)?;
        let (object_store, path) = Self::build_object_store(&url, &scheme)?;
        let local_root = match scheme {
            ObjectStoreScheme::Local => Some(
                url.to_file_path()
                    .map_err(|_| anyhow!("blob store url is not a local path: {}", url))?,
            ),
            _ => None,
        };
        info!("using blob store path: {}", url);
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
            local_root,
        })
    }

    fn build_object_store(
        url: &Url,
        scheme: &ObjectStoreScheme,
    ) -> Result<(Box<dyn ObjectStore>, Path)> {
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(String, String)> = env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        match (os_key.to_str(), os_value.to_str()) {
                            (Some(key), Some(value)) if key.starts_with("AWS_") => {
                                Some((key.to_ascii_lowercase(), value.to_string()))
                            }
                            _ => None,
                        }
                    })
                    .collect();
                Ok(parse_url_opts(url, opts)?)
            }
            _ => Ok(parse_url(url)?),
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    fn location(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.path.clone(), |path, part| path.child(part))
    }

    /// Provisions a namespace under the storage root.
    ///
    /// Local stores get the directory created up front; object stores have no
    /// directories and need nothing.
    pub async fn ensure_prefix(&self, prefix: &str) -> Result<()> {
        if let Some(root) = &self.local_root {
            let dir = root.join(prefix);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Opens a writer whose bytes become visible at `key` only on `finish`.
    pub async fn writer(&self, key: &str) -> Result<BlobWriter> {
        let location = self.location(key);
        let upload = self
            .object_store
            .put_multipart(&location)
            .await
            .with_context(|| format!("failed to open {} for writing", key))?;
        Ok(BlobWriter {
            location,
            inner: WriteMultipart::new(upload),
            hasher: Sha256::new(),
            size_bytes: 0,
        })
    }

    pub async fn put(
        &self,
        key: &str,
        mut data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, anyhow::Error> {
        let mut writer = self.writer(key).await?;
        while let Some(chunk) = data.next().await {
            let written = match chunk {
                Ok(chunk) => writer.write(chunk).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                debug!("aborting write to {}: {:?}", key, err);
                if let Err(abort_err) = writer.abort().await {
                    debug!("failed to abort write to {}: {:?}", key, abort_err);
                }
                return Err(err);
            }
        }
        writer.finish().await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.object_store.head(&self.location(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn head(&self, key: &str) -> Result<BlobMeta> {
        let meta = self
            .object_store
            .head(&self.location(key))
            .await
            .with_context(|| format!("can't stat object {:?}", key))?;
        Ok(self.blob_meta(meta))
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        Ok(self.open(key).await?.body)
    }

    /// Opens `key` for reading. The metadata comes from the same request as
    /// the body, so it can't describe a different version.
    pub async fn open(&self, key: &str) -> Result<BlobObject> {
        let get_result = self
            .object_store
            .get(&self.location(key))
            .await
            .with_context(|| format!("can't get object {:?}", key))?;
        let meta = self.blob_meta(get_result.meta.clone());
        let key = key.to_string();
        let body = get_result
            .into_stream()
            .map_err(move |e| anyhow!("error reading object {:?}: {:?}", key, e))
            .boxed();
        Ok(BlobObject { meta, body })
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    /// Deletes `key`, returning false when nothing was stored there.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        match self.object_store.delete(&self.location(key)).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let prefix = self.location(prefix);
        let metas: Vec<ObjectMeta> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await
            .with_context(|| format!("failed to list {}", prefix))?;
        Ok(metas.into_iter().map(|meta| self.blob_meta(meta)).collect())
    }

    fn blob_meta(&self, meta: ObjectMeta) -> BlobMeta {
        let key = match meta.location.prefix_match(&self.path) {
            Some(parts) => parts
                .map(|part| decode_part(part.as_ref()))
                .collect::<Vec<_>>()
                .join("/"),
            None => decode_part(meta.location.as_ref()),
        };
        BlobMeta {
            key,
            size_bytes: meta.size as u64,
            last_modified: SystemTime::from(meta.last_modified),
            e_tag: meta.e_tag,
        }
    }
}

fn decode_part(part: &str) -> String {
    percent_decode_str(part).decode_utf8_lossy().into_owned()
}

/// Streaming writer over a multipart upload.
pub struct BlobWriter {
    location: Path,
    inner: WriteMultipart,
    hasher: Sha256,
    size_bytes: u64,
}

impl BlobWriter {
    pub async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.inner.wait_for_capacity(MAX_INFLIGHT_PARTS).await?;
        self.hasher.update(&bytes);
        self.size_bytes += bytes.len() as u64;
        self.inner.put(bytes);
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Flushes buffered parts and publishes the object.
    pub async fn finish(self) -> Result<PutResult> {
        let BlobWriter {
            location,
            inner,
            hasher,
            size_bytes,
        } = self;
        inner
            .finish()
            .await
            .with_context(|| format!("failed to finalize {}", location))?;
        Ok(PutResult {
            url: location.to_string(),
            size_bytes,
            sha256_hash: format!("{:x}", hasher.finalize()),
        })
    }

    /// Discards everything written so far; nothing becomes visible.
    pub async fn abort(self) -> Result<()> {
        self.inner.abort().await?;
        Ok(())
    }
}
