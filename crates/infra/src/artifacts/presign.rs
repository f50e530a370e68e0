//! Download links for stored job artifacts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use redrun_core::path::normalize_relative;
use redrun_core::JobId;

use super::backend::ArtifactError;
use super::manager::ArtifactManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresignError {
    #[error("invalid artifact path: {0}")]
    InvalidPath(String),
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("artifact storage unavailable: {0}")]
    Backend(String),
}

/// Response of a successful resolution. Never a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadLink {
    pub job_id: JobId,
    pub path: String,
    pub download_url: String,
}

/// Normalised form of `raw`, or `InvalidPath` if it could escape the job prefix.
pub fn validate_relative_path(raw: &str) -> Result<String, PresignError> {
    normalize_relative(raw).ok_or_else(|| PresignError::InvalidPath(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct PresignResolver {
    artifacts: Arc<ArtifactManager>,
    expires_in: Duration,
}

impl PresignResolver {
    pub fn new(artifacts: Arc<ArtifactManager>, expires_in: Duration) -> Self {
        Self {
            artifacts,
            expires_in,
        }
    }

    /// Signed link for `raw_path` inside the job's namespace.
    ///
    /// The path is validated before any backend call. A missing or
    /// retention-expired object is `NotFound`.
    #[instrument(skip(self, job_id), fields(job_id = %job_id))]
    pub async fn resolve(&self, job_id: JobId, raw_path: &str) -> Result<DownloadLink, PresignError> {
        let path = validate_relative_path(raw_path)?;

        self.artifacts
            .head(job_id, &path)
            .await
            .map_err(|e| into_presign_error(e, &path))?;

        let key = self.artifacts.object_key(job_id, &path);
        let url = self
            .artifacts
            .backend()
            .signed_url(&key, self.expires_in)
            .await
            .map_err(|e| into_presign_error(e, &path))?;

        debug!(key = %key, "download link issued");
        Ok(DownloadLink {
            job_id,
            path,
            download_url: url,
        })
    }
}

fn into_presign_error(e: ArtifactError, path: &str) -> PresignError {
    match e {
        ArtifactError::NotFound(_) => PresignError::NotFound(path.to_string()),
        ArtifactError::InvalidKey(msg) => PresignError::InvalidPath(msg),
        ArtifactError::Backend(msg) | ArtifactError::Packaging(msg) => PresignError::Backend(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::backend::{ArtifactBackend, ObjectEntry, ObjectStoreBackend};
    use crate::artifacts::manager::ArtifactManagerConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory storage that can sign and counts every call.
    struct SigningBackend {
        inner: ObjectStoreBackend,
        calls: AtomicU32,
        unreachable: bool,
    }

    impl SigningBackend {
        fn new(unreachable: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: ObjectStoreBackend::in_memory(),
                calls: AtomicU32::new(0),
                unreachable,
            })
        }

        fn hit(&self) -> Result<(), ArtifactError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                Err(ArtifactError::Backend("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ArtifactBackend for SigningBackend {
        async fn put(&self, key: &str, data: Bytes) -> Result<(), ArtifactError> {
            self.inner.put(key, data).await
        }
        async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError> {
            self.hit()?;
            self.inner.head(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError> {
            self.hit()?;
            self.inner.list(prefix).await
        }
        async fn signed_url(&self, key: &str, e: Duration) -> Result<String, ArtifactError> {
            self.hit()?;
            Ok(format!("https://files.example/{key}?expires={}", e.as_secs()))
        }
        async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
            self.inner.delete(key).await
        }
    }

    fn resolver(backend: Arc<SigningBackend>) -> PresignResolver {
        let manager = ArtifactManager::new(backend, ArtifactManagerConfig::default());
        PresignResolver::new(Arc::new(manager), Duration::from_secs(900))
    }

    #[test]
    fn path_validation() {
        assert_eq!(validate_relative_path("artifacts.zip").unwrap(), "artifacts.zip");
        assert_eq!(validate_relative_path("./a//b.txt").unwrap(), "a/b.txt");
        for bad in ["", "/etc/passwd", "../x", "a/../../b", "C:\\x", "a\\b"] {
            assert!(
                matches!(validate_relative_path(bad), Err(PresignError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn parent_segments_never_reach_backend() {
        let backend = SigningBackend::new(false);
        let r = resolver(backend.clone());
        let err = r.resolve(JobId::new(), "../other/artifacts.zip").await.unwrap_err();
        assert!(matches!(err, PresignError::InvalidPath(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolves_existing_object() {
        let backend = SigningBackend::new(false);
        let id = JobId::new();
        backend
            .put(&format!("{id}/artifacts.zip"), Bytes::from_static(b"zip"))
            .await
            .unwrap();

        let link = resolver(backend).resolve(id, "artifacts.zip").await.unwrap();
        assert_eq!(link.job_id, id);
        assert_eq!(link.path, "artifacts.zip");
        assert_eq!(
            link.download_url,
            format!("https://files.example/{id}/artifacts.zip?expires=900")
        );
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let backend = SigningBackend::new(false);
        let err = resolver(backend)
            .resolve(JobId::new(), "artifacts.zip")
            .await
            .unwrap_err();
        assert_eq!(err, PresignError::NotFound("artifacts.zip".into()));
    }

    #[tokio::test]
    async fn unreachable_backend_is_distinct() {
        let backend = SigningBackend::new(true);
        let err = resolver(backend)
            .resolve(JobId::new(), "artifacts.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, PresignError::Backend(_)));
    }
}
