//! `sgd add <app_id>` – queue a new download.

use anyhow::{anyhow, bail, Result};
use sgd_core::job::{Credentials, Platform};
use sgd_core::manager::{DownloadManager, DownloadRequest};

#[allow(clippy::too_many_arguments)]
pub async fn run_add(
    manager: &DownloadManager,
    app_id: u32,
    name: Option<String>,
    platform: Option<String>,
    username: Option<String>,
    password: Option<String>,
    guard_code: Option<String>,
    validate: bool,
    no_validate: bool,
) -> Result<()> {
    let platform = match platform.as_deref() {
        Some(p) => {
            Platform::from_str(p).ok_or_else(|| anyhow!("unknown platform: {p} (expected windows, linux or macos)"))?
        }
        None => Platform::default(),
    };

    let credentials = match username {
        Some(username) => {
            let password = password
                .or_else(|| std::env::var("SGD_STEAM_PASSWORD").ok())
                .filter(|p| !p.is_empty());
            let Some(password) = password else {
                bail!("a password is required with --username (flag or $SGD_STEAM_PASSWORD)");
            };
            Credentials::Account {
                username,
                password,
                guard_code,
            }
        }
        None => Credentials::Anonymous,
    };

    let validate = match (validate, no_validate) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    let job = manager
        .enqueue(DownloadRequest {
            app_id,
            name,
            platform,
            credentials,
            validate,
        })
        .await?;
    println!("Queued job {} for {} (app {})", job.id, job.name, job.app_id);
    println!("Run `sgd run` to start downloading.");
    Ok(())
}
