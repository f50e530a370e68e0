//! Single-job execution pipeline.
//!
//! ```text
//! claim (queued -> running)
//!   -> validate -> resolve -> engine (bounded) -> classify
//!   -> upload artifacts
//!   -> persist terminal record
//! ```
//!
//! Every claimed job ends terminal. Engine faults, panics and timeouts become
//! `failed` records. The terminal write is retried through transient store
//! faults; only a store that stays down surfaces as [`ExecuteError`].

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use redrun_core::{
    error_kinds, AggregatedResult, Job, JobId, JobStatus, RunDefaults, TestRunRequest,
    ValidationPolicy,
};

use super::store::{JobMutator, JobStore, JobStoreError};
use super::types::{JobPayload, RetryPolicy};
use crate::artifacts::{ArtifactManager, UploadOutcome};
use crate::engine::{AnalysisEngine, ResolvedRun};

const EMPTY_RESULT_MESSAGE: &str = "No tests were executed; aggregated results are empty.";

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Parent of every job's local output directory.
    pub artifacts_root: PathBuf,
    /// Hard wall-clock bound for one engine run.
    pub run_timeout: Duration,
    pub run_defaults: RunDefaults,
    pub validation: ValidationPolicy,
    /// Bound on writing the terminal record through transient store faults.
    pub store_retry: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            artifacts_root: PathBuf::from("/data/artifacts"),
            run_timeout: Duration::from_secs(3600),
            run_defaults: RunDefaults::default(),
            validation: ValidationPolicy::default(),
            store_retry: RetryPolicy::fixed(5, Duration::from_secs(1)),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_artifacts_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts_root = root.into();
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_run_defaults(mut self, defaults: RunDefaults) -> Self {
        self.run_defaults = defaults;
        self
    }

    pub fn with_validation(mut self, policy: ValidationPolicy) -> Self {
        self.validation = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The record was missing or no longer `queued`; nothing was run.
    #[error("job {job_id} rejected: {reason}")]
    Rejected { job_id: JobId, reason: String },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// How a run ended, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
enum RunOutcome {
    Succeeded(AggregatedResult),
    Failed { kind: String, message: String },
}

impl RunOutcome {
    fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RunOutcome::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn status(&self) -> JobStatus {
        match self {
            RunOutcome::Succeeded(_) => JobStatus::Succeeded,
            RunOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Runs dequeued payloads to a terminal state.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn AnalysisEngine>,
    artifacts: Arc<ArtifactManager>,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn AnalysisEngine>,
        artifacts: Arc<ArtifactManager>,
        config: JobExecutorConfig,
    ) -> Self {
        Self {
            store,
            engine,
            artifacts,
            config,
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Local output directory of a job.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.config.artifacts_root.join(job_id.to_string())
    }

    /// Execute one payload and return the terminal record.
    pub async fn execute(&self, payload: JobPayload) -> Result<Job, ExecuteError> {
        let job_id = payload.job_id;

        // A failed edge leaves the status unchanged, which the store rejects.
        let claim = self
            .store
            .update(job_id, &|job: &mut Job| {
                let _ = job.mark_running();
            })
            .await;
        match claim {
            Ok(_) => {}
            Err(e @ (JobStoreError::NotFound(_) | JobStoreError::InvalidTransition { .. })) => {
                warn!(executor = %self.config.name, job_id = %job_id, error = %e, "payload rejected");
                return Err(ExecuteError::Rejected {
                    job_id,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!(executor = %self.config.name, job_id = %job_id, "job started");

        let job_dir = self.job_dir(job_id);
        let outcome = match payload.request().validate(&self.config.validation) {
            Ok(request) => {
                let run = self.resolve(&payload, request, &job_dir);
                self.run_bounded(run).await
            }
            Err(e) => RunOutcome::failed(error_kinds::VALIDATION, e.to_string()),
        };

        let upload = self.artifacts.finalize(job_id, &job_dir).await;
        if let UploadOutcome::Failed { attempts, .. } = &upload {
            warn!(
                job_id = %job_id,
                attempts,
                status = %outcome.status(),
                "job finishes without uploaded artifacts"
            );
        }

        let job = self.persist_terminal(job_id, &outcome).await?;

        match &outcome {
            RunOutcome::Succeeded(_) => {
                info!(executor = %self.config.name, job_id = %job_id, status = %job.status, "job finished");
            }
            RunOutcome::Failed { kind, message } => {
                error!(
                    executor = %self.config.name,
                    job_id = %job_id,
                    status = %job.status,
                    error_type = %kind,
                    error = %message,
                    "job finished"
                );
            }
        }
        Ok(job)
    }

    /// Write the terminal record, retrying transient store faults.
    async fn persist_terminal(&self, job_id: JobId, outcome: &RunOutcome) -> Result<Job, ExecuteError> {
        let finished_at = Utc::now();
        let finish = |job: &mut Job| {
            let _ = match outcome {
                RunOutcome::Succeeded(agg) => job.succeed(agg.clone(), finished_at),
                RunOutcome::Failed { kind, message } => {
                    job.fail(kind.clone(), message.clone(), finished_at)
                }
            };
        };
        let mutate: JobMutator<'_> = &finish;
        let store = &self.store;

        self.config
            .store_retry
            .retry_when(
                "persist terminal record",
                |e: &JobStoreError| {
                    matches!(e, JobStoreError::Storage(_) | JobStoreError::Conflict(_))
                },
                move |attempt| async move {
                    match store.update(job_id, mutate).await {
                        // An earlier attempt may have landed before its reply was lost.
                        Err(e @ JobStoreError::InvalidTransition { .. }) if attempt > 1 => {
                            match store.get(job_id).await {
                                Ok(job) if job.status.is_terminal() => Ok(job),
                                _ => Err(e),
                            }
                        }
                        other => other,
                    }
                },
            )
            .await
            .map(|(job, _)| job)
            .map_err(|(e, attempts)| {
                error!(job_id = %job_id, attempts, error = %e, "failed to persist terminal record");
                ExecuteError::Store(e)
            })
    }

    fn resolve(&self, payload: &JobPayload, request: TestRunRequest, job_dir: &Path) -> ResolvedRun {
        let config = request
            .run_config
            .clone()
            .unwrap_or_default()
            .merged_onto(&self.config.run_defaults);
        let output_dir = match &config.artifacts_path {
            Some(sub) => job_dir.join(sub),
            None => job_dir.to_path_buf(),
        };
        ResolvedRun {
            job_id: payload.job_id,
            tests: request.plan.specs(),
            preset_name: request.plan.preset_name.clone(),
            num_threads: request.plan.num_threads,
            tested_model: request.tested_model,
            attack_model: payload.attack_model.clone(),
            judge_model: payload.judge_model.clone(),
            config,
            output_dir,
        }
    }

    /// Run the engine on its own task under the execution bound.
    async fn run_bounded(&self, run: ResolvedRun) -> RunOutcome {
        let job_id = run.job_id;
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { engine.run(&run).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.run_timeout, task).await {
            Ok(Ok(Ok(aggregated))) if aggregated.is_empty() => {
                RunOutcome::failed(error_kinds::EMPTY_RESULT, EMPTY_RESULT_MESSAGE)
            }
            Ok(Ok(Ok(aggregated))) => RunOutcome::Succeeded(aggregated),
            Ok(Ok(Err(fault))) => {
                debug!(job_id = %job_id, kind = %fault.kind, "engine fault");
                RunOutcome::failed(fault.kind, fault.message)
            }
            Ok(Err(join)) if join.is_panic() => {
                RunOutcome::failed(error_kinds::ENGINE_PANIC, panic_message(join.into_panic()))
            }
            Ok(Err(_)) => RunOutcome::failed(error_kinds::ENGINE_PANIC, "engine task was cancelled"),
            Err(_) => {
                // Dropping the engine future kills any child process it owns.
                abort.abort();
                RunOutcome::failed(
                    error_kinds::EXECUTION_TIMEOUT,
                    format!(
                        "run exceeded the execution limit of {}s",
                        self.config.run_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{
        ArtifactBackend, ArtifactError, ArtifactManagerConfig, ObjectEntry, ObjectStoreBackend,
    };
    use crate::engine::EngineFault;
    use crate::jobs::store::InMemoryJobStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use redrun_core::{
        ClientConfig, CustomTestSpec, RedactedRequest, TestParameter, TestPlan,
    };
    use std::collections::BTreeMap;

    enum Script {
        Result(AggregatedResult),
        Fault(&'static str, &'static str),
        Panic,
        Hang,
    }

    struct ScriptedEngine(Script);

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn run(&self, run: &ResolvedRun) -> Result<AggregatedResult, EngineFault> {
            tokio::fs::create_dir_all(&run.output_dir).await.unwrap();
            tokio::fs::write(run.output_dir.join("run.log"), b"log").await.unwrap();
            match &self.0 {
                Script::Result(agg) => Ok(agg.clone()),
                Script::Fault(kind, msg) => Err(EngineFault::new(*kind, *msg)),
                Script::Panic => panic!("engine blew up"),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    Ok(BTreeMap::new())
                }
            }
        }
    }

    /// Fails the `nth` update (1-indexed) `times` times in a row. With
    /// `lose_reply` the write still lands and only the reply is lost.
    struct BlipStore {
        inner: Arc<InMemoryJobStore>,
        updates: AtomicU32,
        nth: u32,
        times: u32,
        lose_reply: bool,
    }

    #[async_trait]
    impl JobStore for BlipStore {
        async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.create(job).await
        }
        async fn update(&self, job_id: JobId, mutate: JobMutator<'_>) -> Result<Job, JobStoreError> {
            let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.nth && n < self.nth + self.times {
                if self.lose_reply {
                    self.inner.update(job_id, mutate).await?;
                }
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.update(job_id, mutate).await
        }
        async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
            self.inner.get(job_id).await
        }
        async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_running().await
        }
    }

    /// Refuses every upload; reads go to an empty in-memory store.
    struct UnreachableBackend(ObjectStoreBackend);

    #[async_trait]
    impl ArtifactBackend for UnreachableBackend {
        async fn put(&self, _: &str, _: Bytes) -> Result<(), ArtifactError> {
            Err(ArtifactError::Backend("bucket unreachable".into()))
        }
        async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError> {
            self.0.head(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError> {
            self.0.list(prefix).await
        }
        async fn signed_url(&self, key: &str, e: Duration) -> Result<String, ArtifactError> {
            self.0.signed_url(key, e).await
        }
        async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
            self.0.delete(key).await
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        backend: Arc<ObjectStoreBackend>,
        artifacts: Arc<ArtifactManager>,
        executor: JobExecutor,
        _root: tempfile::TempDir,
    }

    fn fixture(script: Script) -> Fixture {
        let store = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        fixture_with(script, store.clone(), store, backend.clone(), backend)
    }

    fn fixture_with(
        script: Script,
        inner: Arc<InMemoryJobStore>,
        store: Arc<dyn JobStore>,
        backend: Arc<ObjectStoreBackend>,
        uploads: Arc<dyn ArtifactBackend>,
    ) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactManager::new(
            uploads,
            ArtifactManagerConfig {
                upload_retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
                ..ArtifactManagerConfig::default()
            },
        ));
        let executor = JobExecutor::new(
            store,
            Arc::new(ScriptedEngine(script)),
            artifacts.clone(),
            JobExecutorConfig::default()
                .with_artifacts_root(root.path())
                .with_run_timeout(Duration::from_secs(60))
                .with_store_retry(RetryPolicy::fixed(3, Duration::from_millis(10))),
        );
        Fixture {
            store: inner,
            backend,
            artifacts,
            executor,
            _root: root,
        }
    }

    fn blip_store(inner: &Arc<InMemoryJobStore>, nth: u32, times: u32) -> Arc<BlipStore> {
        Arc::new(BlipStore {
            inner: inner.clone(),
            updates: AtomicU32::new(0),
            nth,
            times,
            lose_reply: false,
        })
    }

    fn request() -> TestRunRequest {
        TestRunRequest {
            tested_model: ClientConfig::new("http://tested:8000/v1", "tested").with_api_key("sk-t"),
            run_config: None,
            plan: TestPlan {
                preset_name: Some("all".into()),
                ..TestPlan::default()
            },
        }
    }

    async fn submit(f: &Fixture, req: TestRunRequest) -> JobPayload {
        let attack = ClientConfig::new("http://attack/v1", "attack");
        let judge = ClientConfig::new("http://judge/v1", "judge");
        let id = JobId::new();
        let job = Job::queued(id, RedactedRequest::new(&req, &attack, &judge), Utc::now());
        f.store.create(&job).await.unwrap();
        JobPayload::new(id, req, attack, judge, Utc::now())
    }

    fn aggregated() -> AggregatedResult {
        BTreeMap::from([(
            "jailbreak".to_string(),
            BTreeMap::from([("broken".to_string(), 1), ("resilient".to_string(), 9)]),
        )])
    }

    #[tokio::test]
    async fn success_uploads_then_persists_result() {
        let f = fixture(Script::Result(aggregated()));
        let payload = submit(&f, request()).await;
        let id = payload.job_id;

        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result.unwrap().aggregated, aggregated());
        assert!(job.error.is_none());

        f.backend.head(&format!("{id}/artifacts.zip")).await.unwrap();
        assert!(!f.executor.job_dir(id).exists());
    }

    #[tokio::test]
    async fn empty_result_is_a_failure() {
        let f = fixture(Script::Result(BTreeMap::new()));
        let payload = submit(&f, request()).await;
        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let err = job.error.unwrap();
        assert_eq!(err.kind, error_kinds::EMPTY_RESULT);
        assert_eq!(err.message, EMPTY_RESULT_MESSAGE);
    }

    #[tokio::test]
    async fn engine_fault_keeps_name_and_message_and_uploads() {
        let f = fixture(Script::Fault("ConnectionError", "judge unreachable"));
        let payload = submit(&f, request()).await;
        let id = payload.job_id;
        let job = f.executor.execute(payload).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_notice().unwrap(),
            "ConnectionError: judge unreachable"
        );
        f.backend.head(&format!("{id}/artifacts.zip")).await.unwrap();
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let f = fixture(Script::Panic);
        let payload = submit(&f, request()).await;
        let job = f.executor.execute(payload).await.unwrap();
        let err = job.error.unwrap();
        assert_eq!(err.kind, error_kinds::ENGINE_PANIC);
        assert_eq!(err.message, "engine blew up");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forces_failed_state() {
        let f = fixture(Script::Hang);
        let payload = submit(&f, request()).await;
        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, error_kinds::EXECUTION_TIMEOUT);
    }

    #[tokio::test]
    async fn invalid_payload_fails_with_validation_kind() {
        let f = fixture(Script::Result(aggregated()));
        let mut req = request();
        let param = TestParameter {
            name: "lang".into(),
            value: serde_json::json!("en"),
        };
        req.plan.custom_tests = Some(vec![CustomTestSpec {
            import_path: "llamator.attacks.Custom".into(),
            params: vec![param.clone(), param],
        }]);
        let payload = submit(&f, req).await;

        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, error_kinds::VALIDATION);
    }

    #[tokio::test]
    async fn artifacts_path_is_nested_in_job_dir() {
        let f = fixture(Script::Result(aggregated()));
        let mut req = request();
        req.run_config = Some(redrun_core::RunConfig {
            artifacts_path: Some("reports/run1".into()),
            ..Default::default()
        });
        let payload = submit(&f, req.clone()).await;
        let run = f
            .executor
            .resolve(&payload, req, &f.executor.job_dir(payload.job_id));
        assert_eq!(
            run.output_dir,
            f.executor.job_dir(payload.job_id).join("reports/run1")
        );
        assert_eq!(run.attack_model.model, "attack");
        assert!(run.config.enable_logging);
    }

    #[tokio::test]
    async fn non_queued_payload_is_rejected() {
        let f = fixture(Script::Result(aggregated()));
        let payload = submit(&f, request()).await;
        f.executor.execute(payload.clone()).await.unwrap();

        let err = f.executor.execute(payload).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Rejected { .. }));

        let unknown = JobPayload {
            job_id: JobId::new(),
            ..submit(&f, request()).await
        };
        assert!(matches!(
            f.executor.execute(unknown).await,
            Err(ExecuteError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn transient_store_fault_on_terminal_write_is_retried() {
        let inner = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        // Update #1 is the claim, #2 the terminal write.
        let store = blip_store(&inner, 2, 1);
        let f = fixture_with(
            Script::Result(aggregated()),
            inner,
            store.clone(),
            backend.clone(),
            backend,
        );
        let payload = submit(&f, request()).await;
        let id = payload.job_id;

        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(f.store.get(id).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(store.updates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_down_past_retry_bound_is_reported() {
        let inner = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let store = blip_store(&inner, 2, 10);
        let f = fixture_with(
            Script::Result(aggregated()),
            inner,
            store.clone(),
            backend.clone(),
            backend,
        );
        let payload = submit(&f, request()).await;

        let err = f.executor.execute(payload).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Store(JobStoreError::Storage(_))));
        // claim + three terminal attempts
        assert_eq!(store.updates.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_uploads_still_end_terminal_without_archive() {
        let inner = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let f = fixture_with(
            Script::Result(aggregated()),
            inner.clone(),
            inner,
            backend,
            Arc::new(UnreachableBackend(ObjectStoreBackend::in_memory())),
        );
        let payload = submit(&f, request()).await;
        let id = payload.job_id;

        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(f.store.get(id).await.unwrap().status, JobStatus::Succeeded);
        assert!(!f.artifacts.archive_exists(id).await.unwrap());
        // The local copy is kept for the sweeper.
        assert!(f.executor.job_dir(id).exists());
    }

    #[tokio::test]
    async fn lost_reply_on_terminal_write_is_not_an_error() {
        let inner = InMemoryJobStore::arc(Duration::from_secs(3600));
        let backend = Arc::new(ObjectStoreBackend::in_memory());
        let store = Arc::new(BlipStore {
            inner: inner.clone(),
            updates: AtomicU32::new(0),
            nth: 2,
            times: 1,
            lose_reply: true,
        });
        let f = fixture_with(
            Script::Fault("RuntimeError", "boom"),
            inner,
            store,
            backend.clone(),
            backend,
        );
        let payload = submit(&f, request()).await;
        let id = payload.job_id;

        let job = f.executor.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(f.store.get(id).await.unwrap().error_notice().unwrap(), "RuntimeError: boom");
    }
}
