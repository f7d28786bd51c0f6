//! In-memory job store: the single owner of all job records.
//!
//! Every component sees jobs only as clones; the one write path is
//! `mutate`, which applies a pure closure under the store lock. The lock
//! is never held across I/O; persistence is the caller's follow-up step
//! with the returned snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::OpError;
use crate::job::{Job, JobId, JobState};

struct StoreInner {
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
}

/// Shared, concurrency-safe map of all known jobs (queued, active, history).
pub struct JobStore {
    inner: Mutex<StoreInner>,
    history_cap: usize,
}

impl JobStore {
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                jobs: HashMap::new(),
                next_id: 1,
            }),
            history_cap,
        }
    }

    /// Seed the store from persisted records (startup). Ids resume after the
    /// highest seen so they are never reused.
    pub fn load(&self, jobs: Vec<Job>) {
        let mut inner = self.lock();
        for job in jobs {
            inner.next_id = inner.next_id.max(job.id + 1);
            inner.jobs.insert(job.id, job);
        }
    }

    /// Insert a new record, assigning its id. `build` receives the id so the
    /// caller can finish the record (ids appear in derived fields like logs).
    pub fn create(&self, build: impl FnOnce(JobId) -> Job) -> Job {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let job = build(id);
        debug_assert_eq!(job.id, id);
        inner.jobs.insert(id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Apply `f` to the job atomically and return the updated record.
    /// This is the only way job state changes; concurrent writers serialize
    /// here, so a partially-applied update is never observable.
    pub fn mutate(&self, id: JobId, f: impl FnOnce(&mut Job)) -> Result<Job, OpError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(OpError::NotFound(id))?;
        f(job);
        Ok(job.clone())
    }

    pub fn list_by_state(&self, state: JobState) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn snapshot_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Jobs currently holding a concurrency slot.
    pub fn count_active(&self) -> usize {
        self.lock().jobs.values().filter(|j| j.state.is_active()).count()
    }

    /// If a non-terminal job already claims `dir`, return its id.
    pub fn target_in_use(&self, dir: &Path) -> Option<JobId> {
        self.lock()
            .jobs
            .values()
            .find(|j| !j.state.is_terminal() && j.install_dir == dir)
            .map(|j| j.id)
    }

    /// Drop the oldest terminal jobs beyond the history cap. Non-terminal
    /// jobs are never evicted. Returns the removed ids (for DB cleanup).
    pub fn evict_terminal(&self) -> Vec<JobId> {
        let mut inner = self.lock();
        let mut terminal: Vec<(JobId, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .map(|j| (j.id, j.ended_at.unwrap_or(j.created_at)))
            .collect();
        if terminal.len() <= self.history_cap {
            return Vec::new();
        }
        terminal.sort_by_key(|&(id, ended)| (ended, id));
        let excess = terminal.len() - self.history_cap;
        let evicted: Vec<JobId> = terminal[..excess].iter().map(|&(id, _)| id).collect();
        for id in &evicted {
            inner.jobs.remove(id);
        }
        evicted
    }

    /// Remove all terminal jobs matching `filter`. Returns the removed ids.
    pub fn clear_terminal(&self, filter: impl Fn(&Job) -> bool) -> Vec<JobId> {
        let mut inner = self.lock();
        let removed: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && filter(j))
            .map(|j| j.id)
            .collect();
        for id in &removed {
            inner.jobs.remove(id);
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // Poisoning only happens if a writer panicked mid-closure; the
        // closures are pure, so the map is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
