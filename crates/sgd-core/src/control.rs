//! Cancellation plumbing between the facade and running supervisors.
//!
//! Each active job registers a cancel token; a cancel request flips the
//! token and wakes the supervisor, which runs the terminate sequence and
//! settles the job as Cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use crate::job::JobId;

/// One job's cancel signal. Requesting is idempotent; waiting is async.
#[derive(Default)]
pub struct CancelToken {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a request that lands before the
        // supervisor starts waiting is not lost.
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested (immediately if it
    /// already was). Safe to use repeatedly inside `select!`.
    pub async fn requested(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

/// Registry of job id -> cancel token for the currently active jobs.
#[derive(Default)]
pub struct JobControl {
    tokens: RwLock<HashMap<JobId, Arc<CancelToken>>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that is about to run; the returned token is what its
    /// supervisor watches.
    pub fn register(&self, id: JobId) -> Arc<CancelToken> {
        let token = Arc::new(CancelToken::default());
        self.write().insert(id, Arc::clone(&token));
        token
    }

    /// Drop the token when the job settles (any outcome).
    pub fn unregister(&self, id: JobId) {
        self.write().remove(&id);
    }

    /// Request cancellation. Returns false if the job has no active token
    /// (not running), which callers treat per their own idempotency rules.
    pub fn request_cancel(&self, id: JobId) -> bool {
        match self.read().get(&id) {
            Some(token) => {
                token.request();
                true
            }
            None => false,
        }
    }

    /// Cancel everything currently registered (shutdown path).
    pub fn cancel_all(&self) {
        for token in self.read().values() {
            token.request();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Arc<CancelToken>>> {
        self.tokens.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Arc<CancelToken>>> {
        self.tokens.write().unwrap_or_else(|e| e.into_inner())
    }
}
