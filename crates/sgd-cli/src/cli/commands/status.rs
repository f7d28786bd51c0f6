//! `sgd status` – show active, queued and finished jobs.

use anyhow::Result;
use sgd_core::job::Job;
use sgd_core::manager::DownloadManager;

pub fn run_status(manager: &DownloadManager) -> Result<()> {
    let snap = manager.snapshot();

    if snap.active.is_empty() && snap.queued.is_empty() && snap.history.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    if !snap.active.is_empty() {
        println!("Active ({}/{}):", snap.stats.active_count, snap.stats.max_concurrent);
        for job in &snap.active {
            println!(
                "  {:<6} {:<12} {:>6.1}%  {:<12} {}",
                job.id,
                job.state.to_string(),
                job.progress,
                job.speed.as_deref().unwrap_or("-"),
                job.name
            );
        }
    }

    if !snap.queued.is_empty() {
        println!("Queued:");
        for (i, job) in snap.queued.iter().enumerate() {
            println!("  #{:<5} {:<6} {}", i + 1, job.id, job.name);
        }
    }

    if !snap.history.is_empty() {
        println!("History:");
        for job in &snap.history {
            println!(
                "  {:<6} {:<12} {}{}",
                job.id,
                job.state.to_string(),
                job.name,
                failure_suffix(job)
            );
        }
    }

    Ok(())
}

fn failure_suffix(job: &Job) -> String {
    match &job.error {
        Some(detail) => format!("  [{}]", detail.message),
        None => String::new(),
    }
}
