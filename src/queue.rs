use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::JobDescriptor;

/// Per-cluster FIFO of pending jobs.
///
/// Delivery is at-least-once: implementations backed by a durable store may
/// redeliver a job after a crash, and a crash between a successful `shift`
/// and pool registration loses the job. That gap is inherited from the
/// upstream contract and documented rather than papered over.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: JobDescriptor) -> Result<()>;
    async fn shift(&self) -> Result<Option<JobDescriptor>>;
    async fn is_empty(&self) -> bool;
    async fn len(&self) -> usize;
    /// Whether a job with this id is still waiting in the queue.
    async fn contains(&self, job_id: &str) -> bool;
}

/// Default in-process queue. Durable deployments supply their own
/// [`JobQueue`] backed by an ordered store.
#[derive(Default)]
pub struct MemoryQueue {
    inner: tokio::sync::Mutex<VecDeque<JobDescriptor>>,
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: JobDescriptor) -> Result<()> {
        self.inner.lock().await.push_back(job);
        Ok(())
    }

    async fn shift(&self) -> Result<Option<JobDescriptor>> {
        Ok(self.inner.lock().await.pop_front())
    }

    async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn contains(&self, job_id: &str) -> bool {
        self.inner.lock().await.iter().any(|j| j.id == job_id)
    }
}
