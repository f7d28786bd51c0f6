//! CLI command handlers. Each command is in its own file.

mod add;
mod cancel;
mod clear;
mod queue;
mod retry;
mod run;
mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use sgd_core::catalog::SteamStoreCatalog;
use sgd_core::config::SgdConfig;
use sgd_core::manager::DownloadManager;

pub use add::run_add;
pub use cancel::run_cancel;
pub use clear::run_clear;
pub use queue::{run_move, run_remove};
pub use retry::run_retry;
pub use run::run_run;
pub use status::run_status;

/// Open the engine against the real store catalog. The admission loop is
/// only started by the `run` command.
pub async fn open_manager(cfg: SgdConfig) -> Result<DownloadManager> {
    DownloadManager::open(cfg, Arc::new(SteamStoreCatalog))
        .await
        .context("open download manager")
}
