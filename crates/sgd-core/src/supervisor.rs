//! Process supervision: one task per active job.
//!
//! A supervisor owns exactly one SteamCMD run: it builds and spawns the
//! invocation, streams stdout through the progress parser, routes every
//! mutation through the job store, and settles the job into a terminal
//! state. Whatever happens, the task returning is what frees the
//! concurrency slot (the admission loop reaps it from its `JoinSet`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::time::{sleep_until, timeout, Instant};

use crate::control::CancelToken;
use crate::error::DownloadError;
use crate::job::{FailureKind, Job, JobId, JobState};
use crate::jobs_db::unix_timestamp;
use crate::manager::ManagerShared;
use crate::progress::{parse_line, LineUpdate};
use crate::steamcmd::Invocation;

/// How long after stdout EOF the process may take to actually exit before
/// the pipe is considered crashed.
const STREAM_CLOSE_WAIT: Duration = Duration::from_secs(10);

/// Kept stderr lines for failure detail.
const STDERR_TAIL: usize = 8;

enum Outcome {
    Completed,
    Cancelled,
    Failed(DownloadError),
}

/// Run one download attempt for `job_id` and settle it. This is the whole
/// lifetime of the job's concurrency slot.
pub(crate) async fn supervise(shared: Arc<ManagerShared>, job_id: JobId) {
    let token = shared.control.register(job_id);
    // A cancel issued between promotion and registration left the job in
    // Cancelling with no token to flip; honor it now.
    if shared.store.get(job_id).map(|j| j.state) == Some(JobState::Cancelling) {
        token.request();
    }
    let outcome = run_attempt(&shared, job_id, &token).await;
    shared.control.unregister(job_id);
    settle(&shared, job_id, outcome).await;
}

async fn run_attempt(
    shared: &Arc<ManagerShared>,
    job_id: JobId,
    token: &CancelToken,
) -> Outcome {
    let Some(job) = shared.store.get(job_id) else {
        return Outcome::Failed(DownloadError::Internal(format!(
            "job {job_id} vanished before start"
        )));
    };

    let script = match shared.steamcmd.ensure_installed().await {
        Ok(path) => path,
        Err(e) => return Outcome::Failed(e),
    };

    if let Err(e) = tokio::fs::create_dir_all(&job.install_dir).await {
        return Outcome::Failed(DownloadError::Internal(format!(
            "create install dir {}: {e}",
            job.install_dir.display()
        )));
    }

    // A cancel that arrived while we were still setting up: nothing spawned
    // yet, settle directly.
    if token.is_requested() {
        return Outcome::Cancelled;
    }

    let invocation = Invocation::new(
        script,
        job.credentials.clone(),
        job.install_dir.clone(),
        job.platform,
        job.app_id,
        job.validate,
    );
    tracing::info!(
        job_id,
        app_id = job.app_id,
        attempt = job.attempt,
        command = %invocation.redacted(),
        "spawning steamcmd"
    );

    let mut child = match invocation.command().spawn() {
        Ok(child) => child,
        Err(e) => return Outcome::Failed(DownloadError::Spawn(e)),
    };

    let stdout = match child.stdout.take() {
        Some(out) => out,
        None => {
            let _ = child.kill().await;
            return Outcome::Failed(DownloadError::Internal(
                "child stdout not captured".into(),
            ));
        }
    };
    let mut stderr_tail = child.stderr.take().map(spawn_stderr_collector);

    let mut lines = BufReader::new(stdout).lines();
    let mut phase = JobState::Starting;
    let mut saw_output = false;
    let mut grace_checked = false;
    let mut last_persisted_pct = 0.0f32;

    let grace_deadline = Instant::now() + shared.cfg.spawn_grace();
    let stuck_deadline = Instant::now() + shared.cfg.stuck_timeout();

    let outcome = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !saw_output {
                        saw_output = true;
                        // First byte of output: the spawn worked.
                        promote(shared, job_id, &mut phase, JobState::Downloading).await;
                    }
                    tracing::trace!(job_id, line = %line, "steamcmd output");
                    if let Some(err) = apply_line(
                        shared,
                        job_id,
                        &line,
                        &mut phase,
                        job.validate,
                        &mut last_persisted_pct,
                    )
                    .await
                    {
                        // Fatal tool error: don't wait for an exit code the
                        // process may never produce.
                        terminate_child(&mut child, Duration::from_secs(0)).await;
                        break Outcome::Failed(err);
                    }
                }
                Ok(None) => {
                    break handle_eof(
                        shared,
                        job_id,
                        &mut child,
                        &mut phase,
                        token,
                        stderr_tail.take(),
                    )
                    .await
                }
                Err(e) => {
                    terminate_child(&mut child, Duration::from_secs(0)).await;
                    break Outcome::Failed(DownloadError::Internal(format!(
                        "read steamcmd output: {e}"
                    )));
                }
            },
            _ = token.requested() => {
                break cancel_child(shared, job_id, &mut child).await;
            }
            _ = sleep_until(grace_deadline), if phase == JobState::Starting && !grace_checked => {
                grace_checked = true;
                match child.try_wait() {
                    // Still alive and silent past the grace: consider the
                    // spawn successful and the download underway.
                    Ok(None) => promote(shared, job_id, &mut phase, JobState::Downloading).await,
                    // Exited without output: the next next_line() sees the
                    // closed pipe and takes the EOF path.
                    Ok(Some(_)) | Err(_) => {}
                }
            }
            _ = sleep_until(stuck_deadline), if !saw_output => {
                terminate_child(&mut child, Duration::from_secs(0)).await;
                break Outcome::Failed(DownloadError::Stuck(shared.cfg.stuck_timeout()));
            }
        }
    };

    outcome
}

/// Stdout closed: distinguish a normal exit from a crashed pipe.
async fn handle_eof(
    shared: &Arc<ManagerShared>,
    job_id: JobId,
    child: &mut Child,
    phase: &mut JobState,
    token: &CancelToken,
    stderr_tail: Option<tokio::task::JoinHandle<String>>,
) -> Outcome {
    if token.is_requested() {
        terminate_child(child, shared.cfg.cancel_grace()).await;
        return Outcome::Cancelled;
    }
    match timeout(STREAM_CLOSE_WAIT, child.wait()).await {
        Ok(Ok(status)) => {
            if status.success() {
                // A silent-but-successful run still went through the
                // download phase as far as the lifecycle is concerned.
                if *phase == JobState::Starting {
                    promote(shared, job_id, phase, JobState::Downloading).await;
                }
                Outcome::Completed
            } else {
                let code = status.code().unwrap_or(-1);
                let detail = match stderr_tail {
                    Some(handle) => collect_tail(handle).await,
                    None => String::new(),
                };
                Outcome::Failed(DownloadError::NonZeroExit { code, detail })
            }
        }
        Ok(Err(e)) => Outcome::Failed(DownloadError::Internal(format!("wait on steamcmd: {e}"))),
        Err(_) => {
            // Output ended but the process lives on: crashed pipe.
            terminate_child(child, Duration::from_secs(0)).await;
            Outcome::Failed(DownloadError::StreamClosed)
        }
    }
}

/// Apply one parsed output line to the job. Returns a fatal error when the
/// line carries an unrecoverable tool error marker.
async fn apply_line(
    shared: &Arc<ManagerShared>,
    job_id: JobId,
    line: &str,
    phase: &mut JobState,
    validate: bool,
    last_persisted_pct: &mut f32,
) -> Option<DownloadError> {
    let update: LineUpdate = parse_line(line);
    if update.is_empty() {
        return None;
    }

    if let Some(kind) = update.error {
        tracing::warn!(job_id, line = %line, "steamcmd reported a fatal error");
        return Some(match kind {
            FailureKind::Auth => DownloadError::Auth,
            FailureKind::SecondFactor => DownloadError::SecondFactorRequired,
            FailureKind::NotOwned => DownloadError::NotOwned,
            FailureKind::RateLimited => DownloadError::RateLimited,
            _ => DownloadError::Internal(format!("unexpected error marker in: {line}")),
        });
    }

    if update.validating && validate && *phase == JobState::Downloading {
        promote(shared, job_id, phase, JobState::Validating).await;
    }

    let success = update.success;
    let updated = shared.store.mutate(job_id, |job| {
        if let Some(pct) = update.percent {
            // Monotonic within the attempt: the tool restarts its counter
            // per depot, the user-visible value never goes backwards.
            if pct > job.progress {
                job.progress = pct;
            }
        }
        if let Some(speed) = &update.speed {
            job.speed = Some(speed.clone());
        }
        if let Some(eta) = &update.eta {
            job.eta = Some(eta.clone());
        }
        if success {
            job.progress = 100.0;
        }
    });

    if success {
        tracing::info!(job_id, "steamcmd reported the app fully installed");
    }

    // Throttled durability for progress-only updates.
    if let Ok(job) = updated {
        if (job.progress - *last_persisted_pct).abs() >= shared.cfg.progress_persist_step {
            *last_persisted_pct = job.progress;
            persist(shared, &job).await;
        }
    }

    None
}

/// Transition the job into `next` if the edge is legal (a racing cancel may
/// have moved it to Cancelling, in which case the promotion is dropped).
async fn promote(
    shared: &Arc<ManagerShared>,
    job_id: JobId,
    phase: &mut JobState,
    next: JobState,
) {
    *phase = next;
    let updated = shared.store.mutate(job_id, |job| {
        if job.state.can_transition(next) {
            job.state = next;
        }
    });
    if let Ok(job) = updated {
        if job.state == next {
            tracing::debug!(job_id, state = %next, "job state advanced");
            persist(shared, &job).await;
        }
    }
}

/// Graceful-with-escalation cancellation of the running child.
async fn cancel_child(
    shared: &Arc<ManagerShared>,
    job_id: JobId,
    child: &mut Child,
) -> Outcome {
    // The facade normally sets Cancelling before signalling; shutdown-path
    // cancels come straight through the token, so set it here too.
    let _ = shared.store.mutate(job_id, |job| {
        if job.state.can_transition(JobState::Cancelling) {
            job.state = JobState::Cancelling;
        }
    });
    terminate_child(child, shared.cfg.cancel_grace()).await;
    Outcome::Cancelled
}

/// SIGTERM, a bounded grace period, then SIGKILL. On non-unix targets the
/// escalation collapses to a plain kill.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if !grace.is_zero() {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "steamcmd ignored SIGTERM, killing");
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Record the terminal state, persist it, and trim history.
async fn settle(shared: &Arc<ManagerShared>, job_id: JobId, outcome: Outcome) {
    let now = unix_timestamp();
    let mutated = shared.store.mutate(job_id, |job| match &outcome {
        Outcome::Completed => {
            if job.state.can_transition(JobState::Completed) {
                job.state = JobState::Completed;
                job.progress = 100.0;
                job.error = None;
                job.ended_at = Some(now);
            }
        }
        Outcome::Cancelled => {
            if job.state.can_transition(JobState::Cancelling) {
                job.state = JobState::Cancelling;
            }
            if job.state.can_transition(JobState::Cancelled) {
                job.state = JobState::Cancelled;
                job.ended_at = Some(now);
            }
        }
        Outcome::Failed(e) => {
            if job.state.can_transition(JobState::Failed) {
                job.state = JobState::Failed;
                job.error = Some(e.to_detail());
                job.ended_at = Some(now);
            }
        }
    });

    match mutated {
        Ok(job) => {
            match &job.state {
                JobState::Completed => tracing::info!(job_id, "download completed"),
                JobState::Cancelled => tracing::info!(job_id, "download cancelled"),
                JobState::Failed => tracing::warn!(
                    job_id,
                    error = %job.error.as_ref().map(|e| e.message.as_str()).unwrap_or("?"),
                    "download failed"
                ),
                other => tracing::error!(job_id, state = %other, "job settled in a non-terminal state"),
            }
            persist(shared, &job).await;
            trim_history(shared).await;
        }
        Err(e) => tracing::error!(job_id, "settle failed: {e}"),
    }
}

async fn persist(shared: &ManagerShared, job: &Job) {
    if let Err(e) = shared.db.upsert(job).await {
        tracing::warn!(job_id = job.id, "durable job update failed: {e:#}");
    }
}

async fn trim_history(shared: &ManagerShared) {
    for id in shared.store.evict_terminal() {
        if let Err(e) = shared.db.remove(id).await {
            tracing::warn!(job_id = id, "history eviction failed in db: {e:#}");
        }
    }
}

fn spawn_stderr_collector(stderr: ChildStderr) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join(" | ")
    })
}

async fn collect_tail(handle: tokio::task::JoinHandle<String>) -> String {
    // The collector finishes when the pipe closes; once the child has
    // exited that is imminent, but don't hang on it.
    match timeout(Duration::from_secs(2), handle).await {
        Ok(Ok(tail)) => tail,
        _ => String::new(),
    }
}
