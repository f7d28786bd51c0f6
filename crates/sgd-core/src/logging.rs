//! Logging init: file under the XDG state dir, or stderr as a fallback.

use std::fs;
use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sgd=debug"))
}

/// Initialize structured logging to `~/.local/state/sgd/sgd.log`.
/// Returns Err when the log file cannot be opened (state dir unwritable)
/// so the caller can fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<()> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sgd")?;
    let log_dir = xdg_dirs.get_state_home();
    fs::create_dir_all(&log_dir)?;

    let path = log_dir.join("sgd.log");
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    tracing::info!("sgd logging initialized at {}", path.display());
    Ok(())
}

/// Initialize logging to stderr only (no file). Used when `init_logging`
/// fails so the CLI still reports what it is doing.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
