//! `sgd retry <id>` – requeue a failed or cancelled job.

use anyhow::Result;
use sgd_core::job::JobId;
use sgd_core::manager::DownloadManager;

pub async fn run_retry(manager: &DownloadManager, id: JobId) -> Result<()> {
    let job = manager.retry(id).await?;
    println!(
        "Requeued job {id} ({}) for attempt {}",
        job.name, job.attempt
    );
    println!("Run `sgd run` to start downloading.");
    Ok(())
}
