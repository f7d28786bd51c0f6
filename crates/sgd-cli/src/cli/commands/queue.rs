//! `sgd move` / `sgd remove` – edit the queued sub-list.
//!
//! CLI positions are 1-based (matching `sgd status` output); the facade
//! API is 0-based.

use anyhow::{bail, Result};
use sgd_core::manager::DownloadManager;

fn to_index(position: usize) -> Result<usize> {
    if position == 0 {
        bail!("queue positions start at 1");
    }
    Ok(position - 1)
}

pub async fn run_move(manager: &DownloadManager, from: usize, to: usize) -> Result<()> {
    manager.move_queued(to_index(from)?, to_index(to)?).await?;
    println!("Moved queued job from position {from} to {to}");
    Ok(())
}

pub async fn run_remove(manager: &DownloadManager, position: usize) -> Result<()> {
    let job = manager.remove_queued(to_index(position)?).await?;
    println!(
        "Removed job {} ({}) from queue position {position}",
        job.id, job.name
    );
    Ok(())
}
