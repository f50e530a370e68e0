//! Object storage port and its `object_store` implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{local::LocalFileSystem, ObjectMeta, ObjectStore};

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl From<ObjectMeta> for ObjectEntry {
    fn from(meta: ObjectMeta) -> Self {
        Self {
            key: meta.location.to_string(),
            size: meta.size as u64,
            last_modified: meta.last_modified,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("packaging error: {0}")]
    Packaging(String),
}

/// Minimal object storage surface needed for job artifacts.
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Create or overwrite an object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ArtifactError>;

    async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError>;

    /// Every object under `prefix`, in backend order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError>;

    /// Time-limited GET link for one object.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, ArtifactError>;

    /// Delete an object. Missing objects are not an error.
    async fn delete(&self, key: &str) -> Result<(), ArtifactError>;
}

/// [`ArtifactBackend`] over any `object_store` implementation.
///
/// Presigning needs a [`Signer`]; stores without one report a backend error
/// from `signed_url`.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Option<Arc<dyn Signer>>) -> Self {
        Self { store, signer }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), None)
    }

    /// Objects stored as files under `root` (created if missing).
    pub fn local(root: &Path) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(root).map_err(|e| ArtifactError::Backend(e.to_string()))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| ArtifactError::Backend(e.to_string()))?;
        Ok(Self::new(Arc::new(store), None))
    }

    /// S3-compatible bucket (AWS, MinIO).
    ///
    /// When a public endpoint is configured, links are signed against it so
    /// they resolve outside the deployment network.
    #[cfg(feature = "s3")]
    pub fn s3(cfg: &crate::config::S3Settings) -> Result<Self, ArtifactError> {
        use object_store::aws::{AmazonS3, AmazonS3Builder};

        let build = |endpoint: Option<&str>| -> Result<AmazonS3, ArtifactError> {
            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(&cfg.bucket)
                .with_region(&cfg.region)
                .with_access_key_id(&cfg.access_key_id)
                .with_secret_access_key(&cfg.secret_access_key);
            if let Some(endpoint) = endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_virtual_hosted_style_request(false);
            }
            if cfg.allow_http {
                builder = builder.with_allow_http(true);
            }
            builder.build().map_err(|e| ArtifactError::Backend(e.to_string()))
        };

        let store = Arc::new(build(cfg.endpoint.as_deref())?);
        let signer: Arc<dyn Signer> = match cfg.public_endpoint.as_deref() {
            Some(public) => Arc::new(build(Some(public))?),
            None => store.clone(),
        };
        Ok(Self::new(store, Some(signer)))
    }

    fn path(key: &str) -> Result<ObjectPath, ArtifactError> {
        ObjectPath::parse(key).map_err(|e| ArtifactError::InvalidKey(e.to_string()))
    }
}

fn map_err(key: &str, e: object_store::Error) -> ArtifactError {
    match e {
        object_store::Error::NotFound { .. } => ArtifactError::NotFound(key.to_string()),
        other => ArtifactError::Backend(other.to_string()),
    }
}

#[async_trait]
impl ArtifactBackend for ObjectStoreBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ArtifactError> {
        let path = Self::path(key)?;
        self.store
            .put(&path, data.into())
            .await
            .map(|_| ())
            .map_err(|e| map_err(key, e))
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError> {
        let path = Self::path(key)?;
        self.store
            .head(&path)
            .await
            .map(ObjectEntry::from)
            .map_err(|e| map_err(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError> {
        let prefix_path = Self::path(prefix)?;
        let mut stream = self.store.list(Some(&prefix_path));
        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            let meta = item.map_err(|e| map_err(prefix, e))?;
            entries.push(ObjectEntry::from(meta));
        }
        Ok(entries)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, ArtifactError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ArtifactError::Backend("presigned URLs are not supported by this backend".to_string())
        })?;
        let path = Self::path(key)?;
        signer
            .signed_url(http::Method::GET, &path, expires_in)
            .await
            .map(|url| url.to_string())
            .map_err(|e| map_err(key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        let path = Self::path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(ArtifactError::Backend(e.to_string())),
        }
    }
}

#[async_trait]
impl<B: ArtifactBackend + ?Sized> ArtifactBackend for Arc<B> {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ArtifactError> {
        (**self).put(key, data).await
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError> {
        (**self).head(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError> {
        (**self).list(prefix).await
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, ArtifactError> {
        (**self).signed_url(key, expires_in).await
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        (**self).delete(key).await
    }
}
