//! Artifact lifecycle: upload with retry, local cleanup, listing, local sweep.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use redrun_core::JobId;

use super::archive::package_directory;
use super::backend::{ArtifactBackend, ArtifactError, ObjectEntry};
use super::ARCHIVE_NAME;
use crate::jobs::RetryPolicy;

/// Tunables for [`ArtifactManager`].
#[derive(Debug, Clone)]
pub struct ArtifactManagerConfig {
    /// Prepended to every object key (empty or ending with `/`).
    pub key_prefix: String,
    pub upload_retry: RetryPolicy,
    pub list_max_keys: usize,
    /// Objects older than this are hidden and deleted on access. `None` keeps everything.
    pub remote_retention: Option<Duration>,
}

impl Default for ArtifactManagerConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            upload_retry: RetryPolicy::default(),
            list_max_keys: 1000,
            remote_retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

/// What happened to a job's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { attempts: u32, size: u64 },
    /// The job produced no output directory.
    NothingToUpload,
    Failed { attempts: u32, last_error: String },
}

impl UploadOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }
}

/// One listed artifact file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactFile {
    /// Path relative to the job prefix.
    pub path: String,
    pub size_bytes: u64,
    /// Unix timestamp in seconds.
    pub mtime: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

pub struct ArtifactManager {
    backend: Arc<dyn ArtifactBackend>,
    config: ArtifactManagerConfig,
}

impl std::fmt::Debug for ArtifactManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactManager")
            .field("config", &self.config)
            .finish()
    }
}

impl ArtifactManager {
    pub fn new(backend: Arc<dyn ArtifactBackend>, config: ArtifactManagerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn ArtifactBackend> {
        &self.backend
    }

    fn job_prefix(&self, job_id: JobId) -> String {
        format!("{}{}", self.config.key_prefix, job_id)
    }

    /// Object key for a job-relative path. `rel` must already be validated.
    pub fn object_key(&self, job_id: JobId, rel: &str) -> String {
        format!("{}/{}", self.job_prefix(job_id), rel)
    }

    /// Deterministic key of a job's archive.
    pub fn archive_key(&self, job_id: JobId) -> String {
        self.object_key(job_id, ARCHIVE_NAME)
    }

    /// Package `dir` and upload it as the job archive.
    ///
    /// Never fails: exhausted retries are logged and reported as
    /// [`UploadOutcome::Failed`]. On success the local directory is removed
    /// best-effort.
    pub async fn finalize(&self, job_id: JobId, dir: &Path) -> UploadOutcome {
        let owned_dir = dir.to_path_buf();
        let packaged = tokio::task::spawn_blocking(move || package_directory(&owned_dir))
            .await
            .map_err(|e| ArtifactError::Packaging(e.to_string()))
            .and_then(|res| res);

        let archive = match packaged {
            Ok(Some(archive)) => archive,
            Ok(None) => {
                debug!(job_id = %job_id, dir = %dir.display(), "no local artifacts");
                return UploadOutcome::NothingToUpload;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "artifact packaging failed");
                return UploadOutcome::Failed {
                    attempts: 0,
                    last_error: e.to_string(),
                };
            }
        };

        let key = self.archive_key(job_id);
        let size = archive.len() as u64;
        let backend = &self.backend;
        let key_ref = key.as_str();

        let uploaded = self
            .config
            .upload_retry
            .retry("artifact upload", move |_| backend.put(key_ref, archive.clone()))
            .await;

        match uploaded {
            Ok(((), attempts)) => {
                info!(job_id = %job_id, key = %key, size, attempts, "artifacts uploaded");
                cleanup_local(job_id, dir).await;
                UploadOutcome::Uploaded { attempts, size }
            }
            Err((e, attempts)) => {
                error!(
                    job_id = %job_id,
                    key = %key,
                    attempts,
                    error = %e,
                    "artifact upload failed, giving up"
                );
                UploadOutcome::Failed {
                    attempts,
                    last_error: e.to_string(),
                }
            }
        }
    }

    /// Metadata of a job object, treating retention-expired objects as gone.
    pub async fn head(&self, job_id: JobId, rel: &str) -> Result<ObjectEntry, ArtifactError> {
        let key = self.object_key(job_id, rel);
        let entry = self.backend.head(&key).await?;
        if self.is_expired(&entry) {
            self.delete_quietly(&key).await;
            return Err(ArtifactError::NotFound(key));
        }
        Ok(entry)
    }

    pub async fn archive_exists(&self, job_id: JobId) -> Result<bool, ArtifactError> {
        match self.head(job_id, ARCHIVE_NAME).await {
            Ok(_) => Ok(true),
            Err(ArtifactError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Files stored for a job, sorted by path and capped at `list_max_keys`.
    pub async fn list(&self, job_id: JobId) -> Result<Vec<ArtifactFile>, ArtifactError> {
        let prefix = self.job_prefix(job_id);
        let strip = format!("{prefix}/");
        let entries = self.backend.list(&prefix).await?;

        let mut files = Vec::new();
        for entry in entries {
            let Some(rel) = entry.key.strip_prefix(&strip) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            if self.is_expired(&entry) {
                self.delete_quietly(&entry.key).await;
                continue;
            }
            files.push(ArtifactFile {
                path: rel.to_string(),
                size_bytes: entry.size,
                mtime: entry.last_modified.timestamp_millis() as f64 / 1000.0,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.truncate(self.config.list_max_keys);
        Ok(files)
    }

    fn is_expired(&self, entry: &ObjectEntry) -> bool {
        let Some(retention) = self.config.remote_retention else {
            return false;
        };
        match chrono::Duration::from_std(retention) {
            Ok(retention) => entry.last_modified <= Utc::now() - retention,
            Err(_) => false,
        }
    }

    async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            debug!(key = %key, error = %e, "failed to delete expired artifact");
        }
    }
}

async fn cleanup_local(job_id: JobId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(job_id = %job_id, dir = %dir.display(), "local artifacts removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            job_id = %job_id,
            dir = %dir.display(),
            error = %e,
            "failed to remove local artifacts"
        ),
    }
}

/// Remove direct children of `root` last modified more than `retention` ago.
pub async fn sweep_local(root: &Path, retention: Duration) -> SweepReport {
    sweep_local_at(root, retention, SystemTime::now()).await
}

pub async fn sweep_local_at(root: &Path, retention: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = now.checked_sub(retention) else {
        return report;
    };

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot read artifacts root");
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "artifacts root listing aborted");
                break;
            }
        };
        let path = entry.path();
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let modified = meta.modified().unwrap_or(now);
        if modified > cutoff {
            continue;
        }

        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => report.removed += 1,
            Err(e) => {
                report.failed += 1;
                warn!(path = %path.display(), error = %e, "failed to sweep local artifacts");
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        info!(
            root = %root.display(),
            removed = report.removed,
            failed = report.failed,
            "local artifacts sweep finished"
        );
    }
    report
}
