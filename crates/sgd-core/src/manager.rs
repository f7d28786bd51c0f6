//! The download manager facade: every public operation of the engine.
//!
//! Owns the shared pieces (store, queue, control, DB, tool handle) and the
//! admission loop's lifetime. UI layers talk only to this type; they never
//! reach the store or queue directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::admission::{self, DownloadQueue};
use crate::catalog::AppCatalog;
use crate::config::SgdConfig;
use crate::control::JobControl;
use crate::error::OpError;
use crate::job::{Credentials, Job, JobId, JobState, Platform};
use crate::jobs_db::{unix_timestamp, JobsDb};
use crate::steamcmd::SteamCmd;
use crate::store::JobStore;

/// Everything a supervisor or the admission loop needs, shared behind one Arc.
pub(crate) struct ManagerShared {
    pub(crate) cfg: SgdConfig,
    pub(crate) store: JobStore,
    pub(crate) queue: DownloadQueue,
    pub(crate) control: JobControl,
    pub(crate) db: JobsDb,
    pub(crate) steamcmd: SteamCmd,
    pub(crate) catalog: Arc<dyn AppCatalog>,
    shutdown: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Parameters for one new download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub app_id: u32,
    /// Display name override; the catalog name is used when absent.
    pub name: Option<String>,
    pub platform: Platform,
    pub credentials: Credentials,
    /// None = the configured default.
    pub validate: Option<bool>,
}

/// Read-only view of the whole system, safe to render from.
#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    /// Jobs holding a concurrency slot, id order.
    pub active: Vec<Job>,
    /// Queued jobs in promotion order.
    pub queued: Vec<Job>,
    /// Terminal jobs, most recently ended first.
    pub history: Vec<Job>,
    pub stats: SystemStats,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemStats {
    pub max_concurrent: usize,
    pub active_count: usize,
    pub queued_count: usize,
    pub history_count: usize,
}

/// The public engine handle.
pub struct DownloadManager {
    shared: Arc<ManagerShared>,
    loop_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DownloadManager {
    /// Open the engine: database, crash recovery, store and queue seeding.
    /// The admission loop is not running yet; call [`start`](Self::start).
    pub async fn open(cfg: SgdConfig, catalog: Arc<dyn AppCatalog>) -> Result<Self> {
        let state_dir = cfg.state_dir()?;
        let db = JobsDb::open_at(&state_dir)
            .await
            .with_context(|| format!("open job database under {}", state_dir.display()))?;

        let recovered = db.recover().await.context("crash recovery")?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued jobs interrupted by a previous shutdown");
        }

        let jobs = db.load_all().await.context("load job table")?;
        tracing::info!(count = jobs.len(), "loaded persisted jobs");

        let store = JobStore::new(cfg.history_cap);
        let queue = DownloadQueue::new();
        // Restore the promotion order: persisted positions first (stale ids
        // skipped), then any queued job the order table missed, in id order.
        let order = db.load_queue_order().await.context("load queue order")?;
        let queued: Vec<JobId> = jobs
            .iter()
            .filter(|j| j.state == JobState::Queued)
            .map(|j| j.id)
            .collect();
        for id in &order {
            if queued.contains(id) {
                queue.push(*id);
            }
        }
        for id in &queued {
            if !order.contains(id) {
                queue.push(*id);
            }
        }
        store.load(jobs);

        let steamcmd = SteamCmd::new(cfg.steamcmd_dir()?, cfg.auto_install_steamcmd);

        Ok(Self {
            shared: Arc::new(ManagerShared {
                cfg,
                store,
                queue,
                control: JobControl::new(),
                db,
                steamcmd,
                catalog,
                shutdown: AtomicBool::new(false),
            }),
            loop_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Start the admission loop. Idempotent.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_none() {
            let shared = Arc::clone(&self.shared);
            *handle = Some(tokio::spawn(admission::run_admission_loop(shared)));
        }
    }

    /// Add a download to the queue. Checks the catalog (name, free/paid) and
    /// the install-target collision invariant, then wakes the admission loop.
    pub async fn enqueue(&self, req: DownloadRequest) -> Result<Job, OpError> {
        let app_id = req.app_id;
        let catalog = Arc::clone(&self.shared.catalog);
        let lookup = tokio::task::spawn_blocking(move || catalog.lookup(app_id))
            .await
            .map_err(|e| OpError::Internal(format!("catalog task join: {e}")))?;

        let name = match lookup {
            Ok(Some(details)) => {
                if req.credentials.is_anonymous() && !details.is_free {
                    return Err(OpError::PaidAppNeedsLogin(app_id));
                }
                req.name.unwrap_or(details.name)
            }
            Ok(None) => return Err(OpError::UnknownApp(app_id)),
            Err(e) => {
                // The catalog being down must not block enqueuing; ownership
                // problems then surface from the tool itself.
                tracing::warn!(app_id, "catalog lookup failed, continuing: {e:#}");
                req.name.unwrap_or_else(|| format!("App {app_id}"))
            }
        };

        let download_dir = self
            .shared
            .cfg
            .download_dir()
            .map_err(|e| OpError::Internal(format!("resolve download dir: {e:#}")))?;
        let install_dir = download_dir.join(format!("app_{app_id}"));

        if let Some(holder) = self.shared.store.target_in_use(&install_dir) {
            return Err(OpError::TargetInUse {
                dir: install_dir,
                holder,
            });
        }

        let validate = req.validate.unwrap_or(self.shared.cfg.validate_by_default);
        let now = unix_timestamp();
        let job = self.shared.store.create(|id| Job {
            id,
            app_id,
            name: name.clone(),
            install_dir: install_dir.clone(),
            platform: req.platform,
            credentials: req.credentials.clone(),
            validate,
            state: JobState::Queued,
            progress: 0.0,
            speed: None,
            eta: None,
            error: None,
            attempt: 1,
            created_at: now,
            started_at: None,
            ended_at: None,
        });

        self.persist(&job).await;
        self.shared.queue.push(job.id);
        self.persist_queue_order().await;
        tracing::info!(job_id = job.id, app_id, name = %job.name, "job enqueued");
        Ok(job)
    }

    /// Request cancellation. Idempotent: a terminal job is a successful
    /// no-op. Queued jobs go straight to Cancelled (no process exists);
    /// active jobs move to Cancelling and settle asynchronously.
    pub async fn cancel(&self, id: JobId) -> Result<(), OpError> {
        // Pull a queued entry out before touching state so the admission
        // loop cannot promote it mid-cancel.
        self.shared.queue.remove_id(id);

        let now = unix_timestamp();
        let mut direct = false;
        let mut signalled = false;
        let updated = self.shared.store.mutate(id, |job| match job.state {
            JobState::Queued => {
                job.state = JobState::Cancelled;
                job.ended_at = Some(now);
                direct = true;
            }
            s if s.is_active() && s != JobState::Cancelling => {
                job.state = JobState::Cancelling;
                signalled = true;
            }
            _ => {} // already terminal or already cancelling: nothing to do
        })?;

        if direct {
            tracing::info!(job_id = id, "queued job cancelled");
            self.persist(&updated).await;
            self.persist_queue_order().await;
            self.trim_history().await;
        } else if signalled {
            tracing::info!(job_id = id, "cancellation requested");
            self.shared.control.request_cancel(id);
            self.persist(&updated).await;
        }
        Ok(())
    }

    /// Requeue a Failed or Cancelled job as a fresh attempt.
    pub async fn retry(&self, id: JobId) -> Result<Job, OpError> {
        let current = self.shared.store.get(id).ok_or(OpError::NotFound(id))?;
        if !matches!(current.state, JobState::Failed | JobState::Cancelled) {
            return Err(OpError::InvalidState {
                id,
                state: current.state,
                op: "retry",
            });
        }
        // The target may have been claimed by a newer job since this one ended.
        if let Some(holder) = self.shared.store.target_in_use(&current.install_dir) {
            return Err(OpError::TargetInUse {
                dir: current.install_dir,
                holder,
            });
        }

        let mut changed = false;
        let updated = self.shared.store.mutate(id, |job| {
            if matches!(job.state, JobState::Failed | JobState::Cancelled) {
                job.reset_for_retry();
                changed = true;
            }
        })?;
        if !changed {
            return Err(OpError::InvalidState {
                id,
                state: updated.state,
                op: "retry",
            });
        }

        self.persist(&updated).await;
        self.shared.queue.push(id);
        self.persist_queue_order().await;
        tracing::info!(job_id = id, attempt = updated.attempt, "job requeued for retry");
        Ok(updated)
    }

    /// Move a queued job between positions (0-based, queue order).
    pub async fn move_queued(&self, from: usize, to: usize) -> Result<(), OpError> {
        self.shared.queue.move_item(from, to)?;
        self.persist_queue_order().await;
        tracing::info!(from, to, "queue reordered");
        Ok(())
    }

    /// Remove the queued job at `position` (0-based). The record stays in
    /// history as Cancelled; active jobs are never touched by position.
    pub async fn remove_queued(&self, position: usize) -> Result<Job, OpError> {
        let id = self.shared.queue.remove_at(position)?;
        let now = unix_timestamp();
        let updated = self.shared.store.mutate(id, |job| {
            if job.state == JobState::Queued {
                job.state = JobState::Cancelled;
                job.ended_at = Some(now);
            }
        })?;
        self.persist(&updated).await;
        self.persist_queue_order().await;
        self.trim_history().await;
        tracing::info!(job_id = id, position, "job removed from queue");
        Ok(updated)
    }

    /// Consistent read-only view; never blocks on I/O.
    pub fn snapshot(&self) -> SystemSnapshot {
        let all = self.shared.store.snapshot_all();
        let queue_order = self.shared.queue.snapshot();

        let active: Vec<Job> = all.iter().filter(|j| j.state.is_active()).cloned().collect();

        let queued: Vec<Job> = queue_order
            .iter()
            .filter_map(|id| all.iter().find(|j| j.id == *id && j.state == JobState::Queued))
            .cloned()
            .collect();

        let mut history: Vec<Job> =
            all.iter().filter(|j| j.state.is_terminal()).cloned().collect();
        history.sort_by_key(|j| std::cmp::Reverse((j.ended_at.unwrap_or(j.created_at), j.id)));

        let stats = SystemStats {
            max_concurrent: self.shared.cfg.max_concurrent_downloads,
            active_count: active.len(),
            queued_count: queued.len(),
            history_count: history.len(),
        };
        SystemSnapshot {
            active,
            queued,
            history,
            stats,
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.shared.store.get(id)
    }

    /// True when nothing is queued or holding a slot.
    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_empty() && self.shared.store.count_active() == 0
    }

    /// Drop terminal jobs (all of them, or only those in `state`) from the
    /// store and the database. Returns how many were removed.
    pub async fn clear_history(&self, state: Option<JobState>) -> usize {
        let removed = self
            .shared
            .store
            .clear_terminal(|job| state.map_or(true, |s| job.state == s));
        for id in &removed {
            if let Err(e) = self.shared.db.remove(*id).await {
                tracing::warn!(job_id = id, "history clear failed in db: {e:#}");
            }
        }
        removed.len()
    }

    /// Stop the engine: cancel all active jobs and wait for the admission
    /// loop (and every supervisor) to finish.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.control.cancel_all();
        self.shared.queue.wake();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("admission loop join failed: {e}");
            }
        }
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.shared.db.upsert(job).await {
            tracing::warn!(job_id = job.id, "durable job update failed: {e:#}");
        }
    }

    /// Mirror the in-memory promotion order to the database so queue edits
    /// survive a restart.
    async fn persist_queue_order(&self) {
        let order = self.shared.queue.snapshot();
        if let Err(e) = self.shared.db.save_queue_order(&order).await {
            tracing::warn!("durable queue order update failed: {e:#}");
        }
    }

    async fn trim_history(&self) {
        for id in self.shared.store.evict_terminal() {
            if let Err(e) = self.shared.db.remove(id).await {
                tracing::warn!(job_id = id, "history eviction failed in db: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AppDetails;
    use std::collections::HashMap;
    use std::path::Path;

    /// Catalog double: fixed answers, optional simulated outage.
    struct StaticCatalog {
        apps: HashMap<u32, AppDetails>,
        down: bool,
    }

    impl StaticCatalog {
        fn with_apps(apps: Vec<AppDetails>) -> Arc<Self> {
            Arc::new(Self {
                apps: apps.into_iter().map(|a| (a.app_id, a)).collect(),
                down: false,
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                apps: HashMap::new(),
                down: true,
            })
        }
    }

    impl AppCatalog for StaticCatalog {
        fn lookup(&self, app_id: u32) -> anyhow::Result<Option<AppDetails>> {
            if self.down {
                anyhow::bail!("catalog unreachable");
            }
            Ok(self.apps.get(&app_id).cloned())
        }
    }

    fn free_app(app_id: u32, name: &str) -> AppDetails {
        AppDetails {
            app_id,
            name: name.into(),
            is_free: true,
            size_estimate: None,
        }
    }

    fn paid_app(app_id: u32, name: &str) -> AppDetails {
        AppDetails {
            app_id,
            name: name.into(),
            is_free: false,
            size_estimate: Some(1 << 30),
        }
    }

    fn test_config(root: &Path) -> SgdConfig {
        SgdConfig {
            download_dir: Some(root.join("downloads")),
            steamcmd_dir: Some(root.join("steamcmd")),
            state_dir: Some(root.join("state")),
            max_concurrent_downloads: 1,
            ..SgdConfig::default()
        }
    }

    fn anonymous_request(app_id: u32) -> DownloadRequest {
        DownloadRequest {
            app_id,
            name: None,
            platform: Platform::Windows,
            credentials: Credentials::Anonymous,
            validate: Some(false),
        }
    }

    async fn open_manager(root: &Path, catalog: Arc<dyn AppCatalog>) -> DownloadManager {
        DownloadManager::open(test_config(root), catalog)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_names_job_from_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![free_app(730, "Counter-Strike 2")]),
        )
        .await;

        let job = mgr.enqueue(anonymous_request(730)).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.name, "Counter-Strike 2");
        assert_eq!(job.attempt, 1);
        assert_eq!(mgr.snapshot().queued.len(), 1);
    }

    #[tokio::test]
    async fn anonymous_paid_app_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![paid_app(220, "Half-Life 2")]),
        )
        .await;

        let err = mgr.enqueue(anonymous_request(220)).await.unwrap_err();
        assert!(matches!(err, OpError::PaidAppNeedsLogin(220)));
        assert!(mgr.snapshot().queued.is_empty());

        // With a login the same app enqueues fine.
        let job = mgr
            .enqueue(DownloadRequest {
                credentials: Credentials::Account {
                    username: "gamer".into(),
                    password: "pw".into(),
                    guard_code: None,
                },
                ..anonymous_request(220)
            })
            .await
            .unwrap();
        assert_eq!(job.name, "Half-Life 2");
    }

    #[tokio::test]
    async fn unknown_app_rejected_but_outage_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(tmp.path(), StaticCatalog::with_apps(vec![])).await;
        assert!(matches!(
            mgr.enqueue(anonymous_request(999)).await.unwrap_err(),
            OpError::UnknownApp(999)
        ));

        let tmp2 = tempfile::tempdir().unwrap();
        let mgr2 = open_manager(tmp2.path(), StaticCatalog::down()).await;
        let job = mgr2.enqueue(anonymous_request(999)).await.unwrap();
        assert_eq!(job.name, "App 999");
    }

    #[tokio::test]
    async fn duplicate_target_rejected_while_non_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![free_app(730, "CS2")]),
        )
        .await;

        let first = mgr.enqueue(anonymous_request(730)).await.unwrap();
        let err = mgr.enqueue(anonymous_request(730)).await.unwrap_err();
        match err {
            OpError::TargetInUse { holder, .. } => assert_eq!(holder, first.id),
            other => panic!("unexpected error: {other}"),
        }

        // Once the first is terminal the target frees up.
        mgr.cancel(first.id).await.unwrap();
        mgr.enqueue(anonymous_request(730)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_queued_is_direct_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![free_app(730, "CS2")]),
        )
        .await;

        let job = mgr.enqueue(anonymous_request(730)).await.unwrap();
        mgr.cancel(job.id).await.unwrap();
        let cancelled = mgr.get(job.id).unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(cancelled.ended_at.is_some());
        assert!(mgr.snapshot().queued.is_empty());

        // Second cancel on a terminal job: success, no change.
        mgr.cancel(job.id).await.unwrap();
        assert_eq!(mgr.get(job.id).unwrap().state, JobState::Cancelled);

        assert!(matches!(
            mgr.cancel(4242).await.unwrap_err(),
            OpError::NotFound(4242)
        ));
    }

    #[tokio::test]
    async fn retry_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![free_app(730, "CS2")]),
        )
        .await;

        let job = mgr.enqueue(anonymous_request(730)).await.unwrap();

        // Queued is not retryable.
        assert!(matches!(
            mgr.retry(job.id).await.unwrap_err(),
            OpError::InvalidState { op: "retry", .. }
        ));

        mgr.cancel(job.id).await.unwrap();
        let retried = mgr.retry(job.id).await.unwrap();
        assert_eq!(retried.state, JobState::Queued);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.progress, 0.0);
        assert!(retried.error.is_none());
        assert!(retried.started_at.is_none() && retried.ended_at.is_none());
        assert_eq!(mgr.snapshot().queued.len(), 1);
    }

    #[tokio::test]
    async fn reorder_and_remove_respect_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![
                free_app(10, "Ten"),
                free_app(20, "Twenty"),
                free_app(30, "Thirty"),
            ]),
        )
        .await;

        let a = mgr.enqueue(anonymous_request(10)).await.unwrap();
        let b = mgr.enqueue(anonymous_request(20)).await.unwrap();
        let c = mgr.enqueue(anonymous_request(30)).await.unwrap();

        mgr.move_queued(2, 0).await.unwrap();
        let order: Vec<JobId> = mgr.snapshot().queued.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);

        assert!(matches!(
            mgr.move_queued(0, 9).await,
            Err(OpError::OutOfRange { given: 9, len: 3 })
        ));

        let removed = mgr.remove_queued(1).await.unwrap();
        assert_eq!(removed.id, a.id);
        assert_eq!(removed.state, JobState::Cancelled);
        let order: Vec<JobId> = mgr.snapshot().queued.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![c.id, b.id]);

        assert!(matches!(
            mgr.remove_queued(5).await.unwrap_err(),
            OpError::OutOfRange { given: 5, len: 2 }
        ));
    }

    #[tokio::test]
    async fn reopen_recovers_interrupted_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = StaticCatalog::with_apps(vec![free_app(730, "CS2")]);

        let job_id = {
            let mgr = open_manager(tmp.path(), Arc::clone(&catalog) as Arc<dyn AppCatalog>).await;
            let job = mgr.enqueue(anonymous_request(730)).await.unwrap();
            // Simulate a crash mid-download: force the persisted state.
            let downloading = mgr
                .shared
                .store
                .mutate(job.id, |j| {
                    j.state = JobState::Starting;
                    j.state = JobState::Downloading;
                    j.progress = 57.0;
                    j.started_at = Some(1);
                })
                .unwrap();
            mgr.shared.db.upsert(&downloading).await.unwrap();
            job.id
        };

        let mgr = open_manager(tmp.path(), catalog).await;
        let job = mgr.get(job_id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress, 0.0);
        assert!(job.started_at.is_none());
        // Back in the promotion queue after restart.
        assert_eq!(mgr.snapshot().queued.len(), 1);
    }

    #[tokio::test]
    async fn queue_order_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = StaticCatalog::with_apps(vec![
            free_app(10, "Ten"),
            free_app(20, "Twenty"),
            free_app(30, "Thirty"),
        ]);

        let (a, b, c) = {
            let mgr = open_manager(tmp.path(), Arc::clone(&catalog) as Arc<dyn AppCatalog>).await;
            let a = mgr.enqueue(anonymous_request(10)).await.unwrap();
            let b = mgr.enqueue(anonymous_request(20)).await.unwrap();
            let c = mgr.enqueue(anonymous_request(30)).await.unwrap();
            mgr.move_queued(2, 0).await.unwrap();
            (a.id, b.id, c.id)
        };

        let mgr = open_manager(tmp.path(), catalog).await;
        let order: Vec<JobId> = mgr.snapshot().queued.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![c, a, b]);
    }

    #[tokio::test]
    async fn snapshot_orders_history_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = open_manager(
            tmp.path(),
            StaticCatalog::with_apps(vec![free_app(10, "Ten"), free_app(20, "Twenty")]),
        )
        .await;

        let a = mgr.enqueue(anonymous_request(10)).await.unwrap();
        let b = mgr.enqueue(anonymous_request(20)).await.unwrap();
        mgr.cancel(a.id).await.unwrap();
        mgr.cancel(b.id).await.unwrap();
        mgr.shared
            .store
            .mutate(b.id, |j| j.ended_at = Some(j.ended_at.unwrap() + 100))
            .unwrap();

        let snap = mgr.snapshot();
        assert_eq!(snap.history[0].id, b.id);
        assert_eq!(snap.stats.history_count, 2);
        assert_eq!(snap.stats.queued_count, 0);

        assert_eq!(mgr.clear_history(Some(JobState::Failed)).await, 0);
        assert_eq!(mgr.clear_history(None).await, 2);
        assert!(mgr.snapshot().history.is_empty());
    }
}
