//! Integration tests for the full run pipeline.
//!
//! Tests: Submit → Queue → WorkerPool → Executor → Artifacts → RunTool
//!
//! Verifies:
//! - A submitted run is executed by the pool and its summary is served by the tool
//! - The engine output directory is packaged, uploaded and linked
//! - Empty results and engine faults surface as failed runs with a notice
//! - Secrets never reach the stored record

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use redrun_core::{
    error_kinds, AggregatedResult, BasicTestSpec, ClientConfig, JobStatus, RunConfig, TestPlan,
    TestRunRequest, ValidationPolicy,
};

use crate::artifacts::{
    ArtifactBackend, ArtifactError, ArtifactManager, ArtifactManagerConfig, ObjectEntry,
    ObjectStoreBackend, PresignResolver, ARCHIVE_NAME,
};
use crate::engine::{AnalysisEngine, EngineFault, ResolvedRun};
use crate::jobs::{
    AuxiliaryModels, InMemoryJobQueue, InMemoryJobStore, JobExecutor, JobExecutorConfig,
    JobStore, JobSubmitter, RetryPolicy, RunTool, Waiter, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};

/// Object storage that signs links with a fake host.
struct SignedMemory(ObjectStoreBackend);

#[async_trait]
impl ArtifactBackend for SignedMemory {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ArtifactError> {
        self.0.put(key, data).await
    }
    async fn head(&self, key: &str) -> Result<ObjectEntry, ArtifactError> {
        self.0.head(key).await
    }
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, ArtifactError> {
        self.0.list(prefix).await
    }
    async fn signed_url(&self, key: &str, _: Duration) -> Result<String, ArtifactError> {
        Ok(format!("https://files.test/{key}"))
    }
    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.0.delete(key).await
    }
}

/// Writes a report into the output directory and scores each requested test.
struct ReportingEngine;

#[async_trait]
impl AnalysisEngine for ReportingEngine {
    async fn run(&self, run: &ResolvedRun) -> Result<AggregatedResult, EngineFault> {
        if run.preset_name.as_deref() == Some("explode") {
            return Err(EngineFault::new("RuntimeError", "attack model unreachable"));
        }
        tokio::fs::create_dir_all(&run.output_dir)
            .await
            .map_err(|e| EngineFault::new("IOError", e.to_string()))?;
        tokio::fs::write(run.output_dir.join("report.md"), b"# report")
            .await
            .map_err(|e| EngineFault::new("IOError", e.to_string()))?;

        Ok(run
            .tests
            .iter()
            .map(|t| {
                (
                    t.name().to_string(),
                    BTreeMap::from([("passed".to_string(), 2), ("failed".to_string(), 1)]),
                )
            })
            .collect())
    }
}

struct Pipeline {
    store: Arc<InMemoryJobStore>,
    artifacts: Arc<ArtifactManager>,
    tool: RunTool,
    pool: WorkerPoolHandle,
    _root: tempfile::TempDir,
}

fn pipeline() -> Pipeline {
    let root = tempfile::tempdir().unwrap();
    let store = InMemoryJobStore::arc(Duration::from_secs(3600));
    let queue = InMemoryJobQueue::arc();
    let artifacts = Arc::new(ArtifactManager::new(
        Arc::new(SignedMemory(ObjectStoreBackend::in_memory())),
        ArtifactManagerConfig {
            key_prefix: "runs/".to_string(),
            upload_retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
            ..ArtifactManagerConfig::default()
        },
    ));

    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        Arc::new(ReportingEngine),
        artifacts.clone(),
        JobExecutorConfig::default()
            .with_artifacts_root(root.path())
            .with_run_timeout(Duration::from_secs(30)),
    ));
    let pool = WorkerPool::spawn(
        executor,
        queue.clone(),
        WorkerPoolConfig::default()
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(20)),
    );

    let submitter = Arc::new(JobSubmitter::new(
        store.clone(),
        queue,
        AuxiliaryModels {
            attack: ClientConfig::new("http://attack/v1", "attacker").with_api_key("sk-attack"),
            judge: ClientConfig::new("http://judge/v1", "judge"),
        },
        ValidationPolicy::default(),
    ));
    let tool = RunTool::new(
        submitter,
        Waiter::new(store.clone(), Duration::from_millis(20)),
        store.clone(),
        Arc::new(PresignResolver::new(artifacts.clone(), Duration::from_secs(600))),
        Duration::from_secs(10),
    );

    Pipeline {
        store,
        artifacts,
        tool,
        pool,
        _root: root,
    }
}

fn request(plan: TestPlan) -> TestRunRequest {
    TestRunRequest {
        tested_model: ClientConfig::new("http://tested/v1", "victim").with_api_key("sk-tested"),
        run_config: Some(RunConfig {
            artifacts_path: Some("reports".to_string()),
            ..RunConfig::default()
        }),
        plan,
    }
}

fn basic(names: &[&str]) -> TestPlan {
    TestPlan {
        basic_tests: Some(
            names
                .iter()
                .map(|n| BasicTestSpec {
                    code_name: n.to_string(),
                    params: Vec::new(),
                })
                .collect(),
        ),
        ..TestPlan::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_run_succeeds_with_artifacts() {
    let p = pipeline();

    let summary = p
        .tool
        .create_run(request(basic(&["suffix", "base64_injection"])))
        .await
        .unwrap();

    assert_eq!(summary.aggregated_result.len(), 2);
    assert_eq!(summary.aggregated_result["suffix"]["passed"], 2);
    assert!(summary.error_notice.is_none());
    assert_eq!(
        summary.artifacts_url.as_deref(),
        Some(format!("https://files.test/runs/{}/{ARCHIVE_NAME}", summary.job_id).as_str())
    );

    let job = p.store.get(summary.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let json = serde_json::to_string(&job).unwrap();
    assert!(!json.contains("sk-tested"));
    assert!(!json.contains("sk-attack"));

    let files = p.artifacts.list(summary.job_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, ARCHIVE_NAME);

    // Later lookups give the same answer.
    assert_eq!(p.tool.get_run(summary.job_id).await.unwrap(), summary);

    p.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_runs_report_a_notice() {
    let p = pipeline();

    let empty = p.tool.create_run(request(TestPlan::default())).await.unwrap();
    assert!(empty.aggregated_result.is_empty());
    let notice = empty.error_notice.unwrap();
    assert!(notice.starts_with(error_kinds::EMPTY_RESULT));

    let faulted = p
        .tool
        .create_run(request(TestPlan {
            preset_name: Some("explode".to_string()),
            ..TestPlan::default()
        }))
        .await
        .unwrap();
    assert_eq!(
        faulted.error_notice.as_deref(),
        Some("RuntimeError: attack model unreachable")
    );
    // The engine never wrote anything, so there is nothing to link.
    assert!(faulted.artifacts_url.is_none());

    // Counters are bumped right after the terminal write the tool observed.
    let mut stats = p.pool.stats();
    for _ in 0..100 {
        if stats.jobs_processed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = p.pool.stats();
    }
    assert_eq!(stats.jobs_processed, 2);
    assert_eq!(stats.jobs_failed, 2);
    p.pool.shutdown().await;
}
