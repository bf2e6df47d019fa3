#![forbid(unsafe_code)]

//! In-memory job status table. Nothing here survives a restart; the artifact
//! on disk is the fallback authority.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::identifier::JobKey;
use crate::status::{JobState, JobStatus};

/// Concurrent map from job key to status, injected into every component
/// that needs it.
pub trait JobStore: Send + Sync {
    fn put(&self, key: &JobKey, status: JobStatus);

    fn get(&self, key: &JobKey) -> Option<JobStatus>;

    fn delete(&self, key: &JobKey) -> Option<JobStatus>;

    /// Inserts `status` unless an active (queued/processing) entry already
    /// holds the key. Returns `true` when the caller now owns the job.
    fn try_claim(&self, key: &JobKey, status: JobStatus) -> bool;

    /// Progress update from the runner owning `key`. Ignored unless the entry
    /// is processing; the stored percentage never decreases.
    fn record_progress(&self, key: &JobKey, percent: u8, message: &str);

    /// Drops finished entries last updated before `cutoff`. Returns how many
    /// were removed.
    fn prune_terminal(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobKey, JobStatus>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Drops every entry, which is what a process restart looks like.
    pub fn clear(&self) {
        self.jobs.lock().clear();
    }
}

impl JobStore for InMemoryJobStore {
    fn put(&self, key: &JobKey, status: JobStatus) {
        self.jobs.lock().insert(key.clone(), status);
    }

    fn get(&self, key: &JobKey) -> Option<JobStatus> {
        self.jobs.lock().get(key).cloned()
    }

    fn delete(&self, key: &JobKey) -> Option<JobStatus> {
        self.jobs.lock().remove(key)
    }

    fn try_claim(&self, key: &JobKey, status: JobStatus) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.get(key).is_some_and(|existing| existing.state.is_active()) {
            return false;
        }
        jobs.insert(key.clone(), status);
        true
    }

    fn record_progress(&self, key: &JobKey, percent: u8, message: &str) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(key) else {
            return;
        };
        if job.state != JobState::Processing {
            return;
        }
        job.progress = job.progress.max(percent.min(100));
        job.message = message.to_string();
        job.updated_at = Utc::now();
    }

    fn prune_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !(job.state.is_terminal() && job.updated_at < cutoff));
        before - jobs.len()
    }
}
