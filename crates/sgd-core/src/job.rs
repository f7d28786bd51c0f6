//! The job record: one download request and its mutable lifecycle state.

use std::fmt;
use std::path::PathBuf;

/// Job identifier. Assigned once at enqueue time, never reused.
pub type JobId = i64;

/// Lifecycle state of a job, stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Starting,
    Downloading,
    Validating,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Downloading => "downloading",
            JobState::Validating => "validating",
            JobState::Cancelling => "cancelling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => JobState::Queued,
            "starting" => JobState::Starting,
            "downloading" => JobState::Downloading,
            "validating" => JobState::Validating,
            "cancelling" => JobState::Cancelling,
            "completed" => JobState::Completed,
            "cancelled" => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }

    /// Completed, Failed and Cancelled accept no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// States that occupy a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Starting
                | JobState::Downloading
                | JobState::Validating
                | JobState::Cancelling
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle state machine.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Queued, Starting) => true,
            // Direct cancellation of a job that never had a process.
            (Queued, Cancelled) => true,
            (Starting, Downloading) | (Starting, Failed) => true,
            (Downloading, Validating) => true,
            (Downloading, Completed) | (Downloading, Failed) => true,
            (Validating, Completed) | (Validating, Failed) => true,
            // Cancellation request against any state that holds a process.
            (Starting, Cancelling) | (Downloading, Cancelling) | (Validating, Cancelling) => true,
            (Cancelling, Cancelled) => true,
            // Termination may complete either way while a cancel is pending.
            (Cancelling, Completed) | (Cancelling, Failed) => true,
            // Explicit retry.
            (Failed, Queued) | (Cancelled, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target platform passed to SteamCMD. The tool defaults to Windows depots;
/// anything else needs the platform-type override in the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    pub fn as_steam_str(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Some(Platform::Windows),
            "linux" => Some(Platform::Linux),
            "macos" => Some(Platform::MacOs),
            _ => None,
        }
    }
}

/// Login credentials for one job. The secret fields never appear in logs,
/// never serialize, and are dropped before the record reaches the database.
#[derive(Clone)]
pub enum Credentials {
    Anonymous,
    Account {
        username: String,
        password: String,
        guard_code: Option<String>,
    },
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Account { username, .. } => Some(username),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Account {
                username,
                guard_code,
                ..
            } => f
                .debug_struct("Account")
                .field("username", username)
                .field("password", &"****")
                .field("guard_code", &guard_code.as_ref().map(|_| "****"))
                .finish(),
        }
    }
}

/// Taxonomy tag of a failed attempt, persisted with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolMissing,
    Spawn,
    Auth,
    SecondFactor,
    NotOwned,
    RateLimited,
    NonZeroExit,
    StreamClosed,
    Stuck,
    Internal,
}

/// Captured cause of a failed attempt (tag + human-readable context).
/// Stored as JSON in the job table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

/// One download request and its runtime state. Owned exclusively by the
/// `JobStore`; everything outside the store works on clones and routes
/// writes through `JobStore::mutate`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Steam app id being downloaded.
    pub app_id: u32,
    /// Display name from the catalog, or a placeholder.
    pub name: String,
    /// Absolute directory the app installs into. Unique among non-terminal jobs.
    pub install_dir: PathBuf,
    pub platform: Platform,
    pub credentials: Credentials,
    /// Ask SteamCMD to verify files after the download.
    pub validate: bool,
    pub state: JobState,
    /// Percent complete in [0, 100]; monotonic within one attempt.
    pub progress: f32,
    /// Last observed rate, e.g. "5.3 MB/s". Advisory.
    pub speed: Option<String>,
    /// Last observed ETA text. Advisory.
    pub eta: Option<String>,
    pub error: Option<FailureDetail>,
    /// Execution attempt, starting at 1; incremented on each retry.
    pub attempt: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Job {
    /// Reset the mutable per-attempt fields for a retry.
    /// Keeps identity, request parameters and `created_at`.
    pub(crate) fn reset_for_retry(&mut self) {
        self.state = JobState::Queued;
        self.progress = 0.0;
        self.speed = None;
        self.eta = None;
        self.error = None;
        self.started_at = None;
        self.ended_at = None;
        self.attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_roundtrip() {
        for s in [
            JobState::Queued,
            JobState::Starting,
            JobState::Downloading,
            JobState::Validating,
            JobState::Cancelling,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::from_str(s.as_str()), s);
        }
        // Unknown strings degrade to Failed rather than inventing a state.
        assert_eq!(JobState::from_str("paused"), JobState::Failed);
    }

    #[test]
    fn no_shortcut_edges() {
        assert!(!JobState::Queued.can_transition(JobState::Completed));
        assert!(!JobState::Queued.can_transition(JobState::Downloading));
        assert!(!JobState::Completed.can_transition(JobState::Queued));
        assert!(!JobState::Downloading.can_transition(JobState::Starting));
    }

    #[test]
    fn lifecycle_edges() {
        assert!(JobState::Queued.can_transition(JobState::Starting));
        assert!(JobState::Starting.can_transition(JobState::Downloading));
        assert!(JobState::Downloading.can_transition(JobState::Validating));
        assert!(JobState::Validating.can_transition(JobState::Completed));
        assert!(JobState::Downloading.can_transition(JobState::Completed));
        assert!(JobState::Failed.can_transition(JobState::Queued));
        assert!(JobState::Cancelled.can_transition(JobState::Queued));
        assert!(JobState::Queued.can_transition(JobState::Cancelled));
        assert!(JobState::Downloading.can_transition(JobState::Cancelling));
        assert!(JobState::Cancelling.can_transition(JobState::Cancelled));
    }

    #[test]
    fn terminal_and_active_partitions() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Cancelling.is_terminal());
        assert!(JobState::Cancelling.is_active());
        assert!(JobState::Starting.is_active());
        assert!(!JobState::Queued.is_active());
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials::Account {
            username: "gamer".into(),
            password: "hunter2".into(),
            guard_code: Some("ABC12".into()),
        };
        let repr = format!("{creds:?}");
        assert!(repr.contains("gamer"));
        assert!(!repr.contains("hunter2"));
        assert!(!repr.contains("ABC12"));
    }

    #[test]
    fn retry_reset_clears_attempt_state() {
        let mut job = Job {
            id: 1,
            app_id: 730,
            name: "x".into(),
            install_dir: "/tmp/app_730".into(),
            platform: Platform::Windows,
            credentials: Credentials::Anonymous,
            validate: true,
            state: JobState::Failed,
            progress: 61.5,
            speed: Some("2.0 MB/s".into()),
            eta: Some("00:01:00".into()),
            error: Some(FailureDetail {
                kind: FailureKind::NonZeroExit,
                message: "steamcmd exited with code 8".into(),
            }),
            attempt: 1,
            created_at: 100,
            started_at: Some(101),
            ended_at: Some(150),
        };
        job.reset_for_retry();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.attempt, 2);
        assert!(job.error.is_none());
        assert!(job.speed.is_none() && job.eta.is_none());
        assert!(job.started_at.is_none() && job.ended_at.is_none());
        assert_eq!(job.created_at, 100);
    }
}
