//! `sgd clear` – drop finished jobs from history.

use anyhow::{bail, Result};
use sgd_core::job::JobState;
use sgd_core::manager::DownloadManager;

pub async fn run_clear(manager: &DownloadManager, state: Option<String>) -> Result<()> {
    let state = match state.as_deref() {
        None => None,
        Some("completed") => Some(JobState::Completed),
        Some("failed") => Some(JobState::Failed),
        Some("cancelled") => Some(JobState::Cancelled),
        Some(other) => {
            bail!("unknown terminal state: {other} (expected completed, failed or cancelled)")
        }
    };
    let cleared = manager.clear_history(state).await;
    println!("Cleared {cleared} finished jobs from history");
    Ok(())
}
