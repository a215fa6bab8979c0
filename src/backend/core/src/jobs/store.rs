//! In-memory job store.
//!
//! The store is the only owner of canonical [`Job`] records. Everything it
//! hands out is a clone, and all mutations go through [`JobStore::update`] or
//! [`JobStore::modify`], which run the mutator while holding the entry's shard
//! lock. The lock is never held across an `.await`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::job::{Job, JobId, JobState};

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Authoritative record of every job in the process.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a new waiting job, returning its snapshot.
    pub fn create(
        &self,
        task_type: &str,
        queue_name: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Job {
        let job = Job::new(task_type, queue_name, payload, max_attempts);
        self.jobs.insert(job.id, job.clone());

        tracing::debug!(
            job_id = %job.id,
            queue = %queue_name,
            task_type = %task_type,
            "Job created"
        );
        job
    }

    /// Get a snapshot of a job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Drop a job that never left `waiting`, returning it.
    ///
    /// Jobs that were dispatched are kept for inspection.
    pub fn remove(&self, id: &JobId) -> Option<Job> {
        self.jobs
            .remove_if(id, |_, job| job.state == JobState::Waiting)
            .map(|(_, job)| job)
    }

    /// Apply `mutator` atomically and return the new snapshot.
    ///
    /// Unknown ids are a no-op and yield `None`.
    pub fn update<F>(&self, id: &JobId, mutator: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        self.modify(id, mutator).map(|(_, job)| job)
    }

    /// Like [`update`](Self::update), also returning the mutator's output.
    pub fn modify<F, R>(&self, id: &JobId, mutator: F) -> Option<(R, Job)>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut entry = self.jobs.get_mut(id)?;
        let output = mutator(entry.value_mut());
        Some((output, entry.value().clone()))
    }

    /// Snapshots of every job on a queue, oldest first.
    pub fn list_queue(&self, queue_name: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().queue_name == queue_name)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Count jobs on a queue by state.
    pub fn counts(&self, queue_name: &str) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.jobs.iter() {
            let job = entry.value();
            if job.queue_name != queue_name {
                continue;
            }
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
