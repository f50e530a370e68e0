//! Recovery of records left `running` by a worker that died mid-job.
//!
//! A crash between artifact upload and terminal persistence leaves a `running`
//! record behind. The reconciler closes such records as failed; it never
//! re-executes the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use redrun_core::{error_kinds, Job, JobStatus};

use super::store::{JobStore, JobStoreError};
use crate::artifacts::ArtifactManager;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    artifacts: Arc<ArtifactManager>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, artifacts: Arc<ArtifactManager>) -> Self {
        Self { store, artifacts }
    }

    /// Fail every `running` record not updated within `stale_after`.
    pub async fn sweep(&self, stale_after: Duration) -> Result<ReconcileReport, JobStoreError> {
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = ReconcileReport::default();

        for job in self.store.list_running().await? {
            report.examined += 1;
            if job.status != JobStatus::Running || job.updated_at > cutoff {
                report.skipped += 1;
                continue;
            }

            let job_id = job.job_id;
            let message = match self.artifacts.archive_exists(job_id).await {
                Ok(true) => "worker stopped before recording the outcome; artifacts were uploaded",
                Ok(false) => "worker stopped before recording the outcome; no artifacts were uploaded",
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "artifact lookup failed during reconciliation");
                    "worker stopped before recording the outcome"
                }
            };

            let now = Utc::now();
            match self
                .store
                .update(job_id, &|j: &mut Job| {
                    let _ = j.fail(error_kinds::ORPHANED_RUN, message, now);
                })
                .await
            {
                Ok(_) => {
                    report.failed += 1;
                    warn!(job_id = %job_id, "orphaned run marked failed");
                }
                // Finished or expired since the listing.
                Err(JobStoreError::InvalidTransition { .. } | JobStoreError::NotFound(_)) => {
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                failed = report.failed,
                skipped = report.skipped,
                "reconciliation finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactBackend, ArtifactManagerConfig, ObjectStoreBackend};
    use crate::jobs::store::InMemoryJobStore;
    use bytes::Bytes;
    use redrun_core::{JobId, RedactedRequest};

    async fn running(store: &InMemoryJobStore) -> JobId {
        let id = JobId::new();
        store
            .create(&Job::queued(id, RedactedRequest::default(), Utc::now()))
            .await
            .unwrap();
        store
            .update(id, &|j: &mut Job| {
                let _ = j.mark_running();
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn stale_running_jobs_are_failed() {
        let store = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let artifacts = Arc::new(ArtifactManager::new(
            backend.clone(),
            ArtifactManagerConfig::default(),
        ));

        let with_archive = running(&store).await;
        let without = running(&store).await;
        backend
            .put(&format!("{with_archive}/artifacts.zip"), Bytes::from_static(b"z"))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), artifacts);

        // Fresh records are left alone.
        let report = reconciler.sweep(Duration::from_secs(600)).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 2);

        let report = reconciler.sweep(Duration::ZERO).await.unwrap();
        assert_eq!(report.failed, 2);

        let job = store.get(with_archive).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let err = job.error.unwrap();
        assert_eq!(err.kind, error_kinds::ORPHANED_RUN);
        assert!(err.message.contains("artifacts were uploaded"));
        assert!(!err.message.contains("no artifacts"));

        let job = store.get(without).await.unwrap();
        assert!(job.error.unwrap().message.contains("no artifacts"));

        assert!(store.list_running().await.unwrap().is_empty());
    }
}
