//! Error taxonomy for the download engine.
//!
//! `DownloadError` is what a supervisor records on a failed job (it becomes
//! the job's `FailureDetail`); `OpError` is returned synchronously from
//! facade operations and never mutates any job.

use std::path::PathBuf;
use std::time::Duration;

use crate::job::{FailureDetail, FailureKind, JobId, JobState};

/// Failure of one download attempt, as observed by its supervisor.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// SteamCMD is not installed and could not be installed.
    #[error("steamcmd unavailable: {0}")]
    ToolMissing(String),

    /// The child process could not be spawned (permissions, missing script).
    #[error("failed to spawn steamcmd: {0}")]
    Spawn(#[source] std::io::Error),

    /// The tool rejected the supplied account credentials.
    #[error("invalid password or account name")]
    Auth,

    /// The account requires a Steam Guard code that was missing or wrong.
    #[error("Steam Guard code required or rejected")]
    SecondFactorRequired,

    /// The logged-in account does not own the app (or anonymous + paid app).
    #[error("account has no subscription for this app")]
    NotOwned,

    /// Steam throttled the login/download.
    #[error("rate limited by Steam")]
    RateLimited,

    /// The process exited with a non-zero code; `detail` carries a stderr tail.
    #[error("steamcmd exited with code {code}{}", fmt_detail(.detail))]
    NonZeroExit { code: i32, detail: String },

    /// Output pipe closed while the process was still running.
    #[error("steamcmd output stream closed while the process was still running")]
    StreamClosed,

    /// No output at all within the stuck-job window.
    #[error("no output from steamcmd within {0:?}")]
    Stuck(Duration),

    /// Anything else (I/O while streaming, lock poisoning, supervisor bug).
    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

impl DownloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DownloadError::ToolMissing(_) => FailureKind::ToolMissing,
            DownloadError::Spawn(_) => FailureKind::Spawn,
            DownloadError::Auth => FailureKind::Auth,
            DownloadError::SecondFactorRequired => FailureKind::SecondFactor,
            DownloadError::NotOwned => FailureKind::NotOwned,
            DownloadError::RateLimited => FailureKind::RateLimited,
            DownloadError::NonZeroExit { .. } => FailureKind::NonZeroExit,
            DownloadError::StreamClosed => FailureKind::StreamClosed,
            DownloadError::Stuck(_) => FailureKind::Stuck,
            DownloadError::Internal(_) => FailureKind::Internal,
        }
    }

    /// The detail recorded on the job when this attempt fails.
    pub fn to_detail(&self) -> FailureDetail {
        FailureDetail {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Synchronous error from a facade operation. These never touch job state.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The operation is not legal in the job's current state
    /// (e.g. retry on a Completed job).
    #[error("job {id} is {state}, cannot {op}")]
    InvalidState {
        id: JobId,
        state: JobState,
        op: &'static str,
    },

    /// Queue position outside the current queued sub-list.
    #[error("queue position {given} out of range (queue length {len})")]
    OutOfRange { given: usize, len: usize },

    /// Another non-terminal job already installs into this directory.
    #[error("install dir already in use by job {holder}: {}", .dir.display())]
    TargetInUse { dir: PathBuf, holder: JobId },

    /// The catalog positively reported that the app does not exist.
    #[error("app {0} not found in the store catalog")]
    UnknownApp(u32),

    /// Anonymous credentials for an app the catalog reports as paid.
    #[error("app {0} is not free-to-play; a Steam login is required")]
    PaidAppNeedsLogin(u32),

    #[error("internal error: {0}")]
    Internal(String),
}
