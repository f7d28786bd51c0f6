//! `sgd cancel <id>` – cancel a job.

use anyhow::Result;
use sgd_core::job::JobId;
use sgd_core::manager::DownloadManager;

pub async fn run_cancel(manager: &DownloadManager, id: JobId) -> Result<()> {
    manager.cancel(id).await?;
    match manager.get(id) {
        Some(job) => println!("Job {id} is now {}", job.state),
        None => println!("Cancellation requested for job {id}"),
    }
    Ok(())
}
