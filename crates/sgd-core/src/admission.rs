//! Admission control: the one place Queued jobs become Starting.
//!
//! The queue order lives here (a small id list), separate from the job
//! store, so reorder/remove touch one short structure. The loop is the
//! single promoter: the capacity check and the promotion happen in one
//! sequential decision-maker, so the active count can never overshoot
//! `max_concurrent` no matter how operations race.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::error::OpError;
use crate::job::{FailureDetail, FailureKind, JobId, JobState};
use crate::jobs_db::unix_timestamp;
use crate::manager::ManagerShared;
use crate::supervisor;

/// Fallback wake for the admission loop; normal wakes are event-driven.
const IDLE_TICK: Duration = Duration::from_secs(5);

/// FIFO of queued job ids plus the loop's wake signal.
#[derive(Default)]
pub struct DownloadQueue {
    ids: Mutex<VecDeque<JobId>>,
    wake: Notify,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job and wake the loop.
    pub fn push(&self, id: JobId) {
        self.lock().push_back(id);
        self.wake();
    }

    pub fn pop_front(&self) -> Option<JobId> {
        self.lock().pop_front()
    }

    /// Remove a specific id wherever it sits (queued-job cancellation).
    pub fn remove_id(&self, id: JobId) -> bool {
        let mut ids = self.lock();
        match ids.iter().position(|&q| q == id) {
            Some(pos) => {
                ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove the entry at `position` (0-based) and return its id.
    pub fn remove_at(&self, position: usize) -> Result<JobId, OpError> {
        let mut ids = self.lock();
        if position >= ids.len() {
            return Err(OpError::OutOfRange {
                given: position,
                len: ids.len(),
            });
        }
        Ok(ids.remove(position).expect("position checked"))
    }

    /// Move the entry at `from` to `to` (both 0-based).
    pub fn move_item(&self, from: usize, to: usize) -> Result<(), OpError> {
        let mut ids = self.lock();
        let len = ids.len();
        if from >= len || to >= len {
            let given = if from >= len { from } else { to };
            return Err(OpError::OutOfRange { given, len });
        }
        if from != to {
            let id = ids.remove(from).expect("position checked");
            ids.insert(to, id);
        }
        Ok(())
    }

    /// Current order, head first.
    pub fn snapshot(&self) -> Vec<JobId> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wake the admission loop (enqueue, retry, shutdown, slot freed).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<JobId>> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The long-lived admission loop. Fills free slots from the queue head,
/// runs one supervisor task per promoted job, and reaps finished tasks.
/// Exits once shutdown is requested and the last supervisor returned.
pub(crate) async fn run_admission_loop(shared: Arc<ManagerShared>) {
    let max_concurrent = shared.cfg.max_concurrent_downloads.max(1);
    let mut active: JoinSet<JobId> = JoinSet::new();
    let mut task_jobs: HashMap<tokio::task::Id, JobId> = HashMap::new();

    tracing::info!(max_concurrent, "admission loop started");

    loop {
        if !shared.is_shutdown() {
            while active.len() < max_concurrent {
                let Some(job_id) = promote_next(&shared).await else {
                    break;
                };
                let ctx = Arc::clone(&shared);
                let handle =
                    active.spawn(async move {
                        supervisor::supervise(ctx, job_id).await;
                        job_id
                    });
                task_jobs.insert(handle.id(), job_id);
            }
        }

        if shared.is_shutdown() && active.is_empty() {
            break;
        }

        tokio::select! {
            Some(finished) = active.join_next_with_id() => {
                match finished {
                    Ok((task_id, job_id)) => {
                        task_jobs.remove(&task_id);
                        tracing::debug!(job_id, "supervisor finished, slot freed");
                    }
                    Err(join_err) => {
                        // A panicked supervisor must not leak capacity or
                        // leave its job undead.
                        let job_id = task_jobs.remove(&join_err.id());
                        tracing::error!(?job_id, "supervisor task died: {join_err}");
                        if let Some(job_id) = job_id {
                            fail_abandoned(&shared, job_id).await;
                        }
                    }
                }
            }
            _ = shared.queue.notified() => {}
            _ = tokio::time::sleep(IDLE_TICK) => {}
        }
    }

    tracing::info!("admission loop stopped");
}

/// Pop queue entries until one is still genuinely Queued, transition it to
/// Starting, and hand it back. Entries whose job moved on (cancelled while
/// queued, evicted) are dropped silently.
async fn promote_next(shared: &Arc<ManagerShared>) -> Option<JobId> {
    loop {
        let job_id = shared.queue.pop_front()?;
        let now = unix_timestamp();
        let promoted = shared.store.mutate(job_id, |job| {
            if job.state == JobState::Queued {
                job.state = JobState::Starting;
                job.started_at = Some(now);
                job.progress = 0.0;
                job.speed = None;
                job.eta = None;
            }
        });
        match promoted {
            Ok(job) if job.state == JobState::Starting => {
                tracing::info!(job_id, app_id = job.app_id, "job promoted to Starting");
                if let Err(e) = shared.db.upsert(&job).await {
                    tracing::warn!(job_id, "durable job update failed: {e:#}");
                }
                return Some(job_id);
            }
            Ok(job) => {
                tracing::debug!(job_id, state = %job.state, "skipping stale queue entry");
            }
            Err(_) => {
                tracing::debug!(job_id, "skipping queue entry for unknown job");
            }
        }
    }
}

/// Terminal bookkeeping for a job whose supervisor never settled it.
async fn fail_abandoned(shared: &Arc<ManagerShared>, job_id: JobId) {
    shared.control.unregister(job_id);
    let now = unix_timestamp();
    let mutated = shared.store.mutate(job_id, |job| {
        if !job.state.is_terminal() {
            job.state = JobState::Failed;
            job.error = Some(FailureDetail {
                kind: FailureKind::Internal,
                message: "supervisor aborted unexpectedly".into(),
            });
            job.ended_at = Some(now);
        }
    });
    if let Ok(job) = mutated {
        if let Err(e) = shared.db.upsert(&job).await {
            tracing::warn!(job_id, "durable job update failed: {e:#}");
        }
    }
}
