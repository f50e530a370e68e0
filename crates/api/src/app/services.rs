//! Service wiring: settings in, job store/queue/artifacts/engine/executor out.
//!
//! The same wiring serves the HTTP process and the standalone worker, so a
//! job accepted by one is executed by the other through the shared store and
//! queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use redrun_infra::{
    artifacts::{
        sweep_local, ArtifactBackend, ArtifactManager, ArtifactManagerConfig, ObjectStoreBackend,
        PresignResolver, SweepReport,
    },
    config::{ArtifactBackendKind, ArtifactSettings, Settings, StoreSettings},
    engine::{AnalysisEngine, CommandEngine, CommandEngineConfig},
    jobs::{
        AuxiliaryModels, InMemoryJobQueue, InMemoryJobStore, JobExecutor, JobExecutorConfig,
        JobQueue, JobStore, JobSubmitter, Reconciler, RedisJobQueue, RedisJobStore, RetryPolicy,
        RunTool, Waiter, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
    },
};

/// How often stale local job directories are swept while workers run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct AppServices {
    pub settings: Settings,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub submitter: Arc<JobSubmitter>,
    pub artifacts: Arc<ArtifactManager>,
    pub presign: Arc<PresignResolver>,
    pub tool: Arc<RunTool>,
    pub executor: Arc<JobExecutor>,
}

impl AppServices {
    /// Production wiring: the configured engine program runs every job.
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let engine = CommandEngine::new(
            CommandEngineConfig::new(settings.execution.engine_program.clone())
                .with_args(settings.execution.engine_args.clone()),
        );
        Self::with_engine(settings, Arc::new(engine))
    }

    pub fn with_engine(settings: Settings, engine: Arc<dyn AnalysisEngine>) -> anyhow::Result<Self> {
        let (store, queue) = build_jobs(&settings.store)?;

        let backend = build_backend(&settings.artifacts)?;
        let artifacts = Arc::new(ArtifactManager::new(
            backend,
            ArtifactManagerConfig {
                key_prefix: settings.artifacts.key_prefix.clone(),
                upload_retry: RetryPolicy::fixed(
                    settings.artifacts.upload_max_attempts,
                    settings.artifacts.upload_retry_delay,
                ),
                list_max_keys: settings.artifacts.list_max_keys,
                remote_retention: settings.artifacts.remote_retention,
            },
        ));
        let presign = Arc::new(PresignResolver::new(
            artifacts.clone(),
            settings.artifacts.presign_expires,
        ));

        let submitter = Arc::new(JobSubmitter::new(
            store.clone(),
            queue.clone(),
            AuxiliaryModels {
                attack: settings.models.attack.clone(),
                judge: settings.models.judge.clone(),
            },
            settings.execution.validation_policy(),
        ));
        let tool = Arc::new(RunTool::new(
            submitter.clone(),
            Waiter::new(store.clone(), settings.execution.wait_poll_interval),
            store.clone(),
            presign.clone(),
            settings.execution.wait_timeout,
        ));

        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            engine,
            artifacts.clone(),
            JobExecutorConfig::default()
                .with_artifacts_root(settings.artifacts.root.clone())
                .with_run_timeout(settings.execution.run_timeout)
                .with_run_defaults(settings.execution.run_defaults.clone())
                .with_validation(settings.execution.validation_policy()),
        ));

        Ok(Self {
            settings,
            store,
            queue,
            submitter,
            artifacts,
            presign,
            tool,
            executor,
        })
    }

    /// Start `concurrency` workers draining the queue.
    pub fn spawn_workers(&self, name: &str) -> WorkerPoolHandle {
        WorkerPool::spawn(
            self.executor.clone(),
            self.queue.clone(),
            WorkerPoolConfig::default()
                .with_name(name)
                .with_concurrency(self.settings.execution.concurrency)
                .with_poll_interval(self.settings.execution.queue_poll_interval),
        )
    }

    /// Close runs orphaned by a previous worker, if enabled.
    pub async fn reconcile_on_start(&self) {
        if !self.settings.execution.reconcile_on_start {
            return;
        }
        let reconciler = Reconciler::new(self.store.clone(), self.artifacts.clone());
        if let Err(e) = reconciler.sweep(self.settings.reconcile_stale_after()).await {
            warn!(error = %e, "start-up reconciliation failed");
        }
    }

    /// Create the local artifacts root and drop job directories past retention.
    pub async fn sweep_on_start(&self) -> anyhow::Result<SweepReport> {
        let root = &self.settings.artifacts.root;
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(sweep_local(root, self.settings.artifacts.local_retention).await)
    }

    /// Hourly local sweep for as long as the returned task lives.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let root = self.settings.artifacts.root.clone();
        let retention = self.settings.artifacts.local_retention;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                sweep_local(&root, retention).await;
            }
        })
    }
}

fn build_jobs(settings: &StoreSettings) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn JobQueue>)> {
    match &settings.redis_url {
        Some(url) => {
            let prefix = Some(settings.key_prefix.clone());
            let store = RedisJobStore::new(url, prefix.clone(), settings.job_ttl)
                .context("failed to configure redis job store")?;
            let queue =
                RedisJobQueue::new(url, prefix).context("failed to configure redis job queue")?;
            info!(key_prefix = %settings.key_prefix, "using redis job store");
            Ok((Arc::new(store), Arc::new(queue)))
        }
        None => {
            warn!("REDRUN_REDIS_URL not set; jobs are kept in process memory");
            let store: Arc<dyn JobStore> = InMemoryJobStore::arc(settings.job_ttl);
            let queue: Arc<dyn JobQueue> = InMemoryJobQueue::arc();
            Ok((store, queue))
        }
    }
}

fn build_backend(settings: &ArtifactSettings) -> anyhow::Result<Arc<dyn ArtifactBackend>> {
    let backend = match settings.effective_backend() {
        ArtifactBackendKind::Memory => ObjectStoreBackend::in_memory(),
        ArtifactBackendKind::Local | ArtifactBackendKind::Auto => {
            ObjectStoreBackend::local(&settings.local_store_dir).with_context(|| {
                format!(
                    "failed to open local artifact store at {}",
                    settings.local_store_dir.display()
                )
            })?
        }
        ArtifactBackendKind::S3 => {
            let s3 = settings
                .s3
                .as_ref()
                .context("s3 artifact backend selected without REDRUN_S3_BUCKET")?;
            ObjectStoreBackend::s3(s3).context("failed to configure s3 artifact backend")?
        }
    };
    info!(backend = ?settings.effective_backend(), "artifact backend ready");
    Ok(Arc::new(backend))
}
