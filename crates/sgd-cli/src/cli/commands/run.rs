//! `sgd run` – run the engine until the queue is drained.

use std::time::Duration;

use anyhow::Result;
use sgd_core::manager::DownloadManager;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_run(manager: &DownloadManager) -> Result<()> {
    if manager.is_idle() {
        println!("No queued jobs.");
        return Ok(());
    }

    manager.start().await;

    // Only report jobs that finish during this run, not prior history.
    let mut done = manager.snapshot().stats.history_count;
    loop {
        tokio::time::sleep(PROGRESS_INTERVAL).await;

        let snap = manager.snapshot();
        for job in &snap.active {
            println!(
                "\r  job {}  {}  {:>5.1}%  {}  ETA {}",
                job.id,
                job.name,
                job.progress,
                job.speed.as_deref().unwrap_or("-"),
                job.eta.as_deref().unwrap_or("?")
            );
        }
        if snap.stats.history_count > done {
            for job in snap.history.iter().take(snap.stats.history_count - done) {
                match &job.error {
                    None => println!("job {} ({}) finished: {}", job.id, job.name, job.state),
                    Some(detail) => {
                        println!("job {} ({}) failed: {}", job.id, job.name, detail.message)
                    }
                }
            }
            done = snap.stats.history_count;
        }

        if manager.is_idle() {
            break;
        }
    }

    manager.shutdown().await;
    println!("Queue drained.");
    Ok(())
}
