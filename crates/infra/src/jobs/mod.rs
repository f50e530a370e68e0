//! Job lifecycle plumbing: storage, queueing, execution and waiting.
//!
//! ## Flow
//!
//! - `JobSubmitter` validates a request, records it as `queued` and enqueues the payload
//! - `WorkerPool` dequeues payloads and hands them to `JobExecutor`
//! - `JobExecutor` drives `queued -> running -> succeeded|failed`, running the
//!   analysis engine under a timeout and uploading artifacts before the terminal write
//! - `Waiter` and `RunTool` give callers a blocking view of a run
//! - `Reconciler` closes records orphaned by a dead worker

pub mod executor;
pub mod pool;
pub mod queue;
pub mod reconcile;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod submit;
pub mod tool;
pub mod types;
pub mod wait;

pub use executor::{ExecuteError, JobExecutor, JobExecutorConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerPoolStats};
pub use queue::{InMemoryJobQueue, JobQueue, QueueError};
pub use reconcile::{ReconcileReport, Reconciler};
#[cfg(feature = "redis")]
pub use redis_store::{RedisJobQueue, RedisJobStore};
pub use store::{InMemoryJobStore, JobMutator, JobStore, JobStoreError, DEFAULT_KEY_PREFIX};
pub use submit::{AuxiliaryModels, JobSubmitter, SubmitError};
pub use tool::{RunTool, ToolError, ToolRunResponse};
pub use types::{JobPayload, RetryPolicy};
pub use wait::{WaitError, Waiter};
