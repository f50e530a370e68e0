//! Work queue between the submitter and the worker pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::types::JobPayload;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("queue serialization error: {0}")]
    Serialization(String),
}

/// FIFO work queue.
///
/// Delivery is at-most-once: a dequeued payload is gone from the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), QueueError>;

    /// Pop the oldest payload without blocking. `None` when empty.
    async fn dequeue(&self) -> Result<Option<JobPayload>, QueueError>;
}

/// In-process queue for tests/dev and single-binary deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    items: Mutex<VecDeque<JobPayload>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|q| q.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), QueueError> {
        self.items
            .lock()
            .map_err(|_| QueueError::Command("queue lock poisoned".to_string()))?
            .push_back(payload.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<JobPayload>, QueueError> {
        Ok(self
            .items
            .lock()
            .map_err(|_| QueueError::Command("queue lock poisoned".to_string()))?
            .pop_front())
    }
}

#[async_trait]
impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), QueueError> {
        (**self).enqueue(payload).await
    }

    async fn dequeue(&self) -> Result<Option<JobPayload>, QueueError> {
        (**self).dequeue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use redrun_core::{ClientConfig, JobId, TestPlan, TestRunRequest};

    fn payload() -> JobPayload {
        let req = TestRunRequest {
            tested_model: ClientConfig::new("http://t/v1", "t"),
            run_config: None,
            plan: TestPlan::default(),
        };
        JobPayload::new(
            JobId::new(),
            req,
            ClientConfig::new("http://a/v1", "a"),
            ClientConfig::new("http://j/v1", "j"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = InMemoryJobQueue::new();
        let (a, b) = (payload(), payload());
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();
        assert_eq!(q.len(), 2);

        assert_eq!(q.dequeue().await.unwrap().unwrap().job_id, a.job_id);
        assert_eq!(q.dequeue().await.unwrap().unwrap().job_id, b.job_id);
        assert!(q.dequeue().await.unwrap().is_none());
        assert!(q.is_empty());
    }
}
