//! Job model and persistence seam
//!
//! A [`Job`] is one submitted manifest's state: identity (id + content
//! hash), resolved name, the manifest text, and the logical files assembled
//! at ingestion time. Storage is behind the [`JobStore`] trait so a
//! relational backend can replace [`MemoryJobStore`] without touching the
//! queue manager.

use crate::client::SegmentId;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted, metadata probing not finished
    Queued,
    /// Ready to stream
    Finished,
    /// Rejected or failed after acceptance
    Failed,
}

/// One logical file reconstructed from manifest entries
///
/// Multi-part archives are merged before a `JobFile` is built, so the
/// segment list spans every part in order. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFile {
    /// File identifier
    pub id: Uuid,
    /// Canonical path within the job
    pub path: String,
    /// Declared size in bytes
    pub size: u64,
    /// Ordered segment identifiers reconstructing the file
    pub segment_ids: Vec<SegmentId>,
}

/// One submitted manifest's persisted state
#[derive(Debug, Clone)]
pub struct Job {
    /// Job identifier
    pub id: Uuid,
    /// Content hash of the manifest (or a synthetic hash for re-submissions)
    pub hash: String,
    /// Resolved job name
    pub name: String,
    /// Name of the submitted manifest file
    pub nzb_file_name: String,
    /// Raw manifest text
    pub nzb_contents: String,
    /// Optional category
    pub category: Option<String>,
    /// Scheduling priority as submitted
    pub priority: i32,
    /// Submission time
    pub added: DateTime<Utc>,
    /// Completion time, once finished
    pub completed: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub status: JobStatus,
    /// Sum of the logical files' sizes
    pub total_size: u64,
    /// The job's logical files
    pub files: Vec<JobFile>,
}

/// Persistence surface for jobs
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job
    async fn insert(&self, job: Job) -> Result<()>;

    /// All jobs
    async fn list(&self) -> Result<Vec<Job>>;

    /// Job by identifier
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Job by content hash
    async fn get_by_hash(&self, hash: &str) -> Result<Option<Job>>;

    /// Job by (name, category) pair
    async fn get_by_name(&self, name: &str, category: Option<&str>) -> Result<Option<Job>>;

    /// Update a job's status, stamping `completed` when finished
    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<()>;

    /// Remove a job, returning it if it existed
    async fn delete(&self, id: Uuid) -> Result<Option<Job>>;

    /// Remove every job
    async fn delete_all(&self) -> Result<()>;
}

/// In-memory job store
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.added);
        Ok(all)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.hash == hash)
            .cloned())
    }

    async fn get_by_name(&self, name: &str, category: Option<&str>) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.name == name && j.category.as_deref() == category)
            .cloned())
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.status = status;
            if status == JobStatus::Finished {
                job.completed = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.write().await.remove(&id))
    }

    async fn delete_all(&self) -> Result<()> {
        self.jobs.write().await.clear();
        Ok(())
    }
}
