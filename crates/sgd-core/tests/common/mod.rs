//! Shared fixtures: a fake `steamcmd.sh` and an offline catalog, so the
//! integration tests drive the real engine without Steam or the network.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sgd_core::catalog::{AppCatalog, AppDetails};
use sgd_core::config::SgdConfig;

/// Install a fake SteamCMD under `<root>/steamcmd`: a shell script with the
/// given body plus the `linux32/steamcmd` marker the engine checks for.
pub fn install_fake_tool(root: &Path, body: &str) {
    let dir = root.join("steamcmd");
    std::fs::create_dir_all(dir.join("linux32")).unwrap();
    std::fs::write(dir.join("linux32").join("steamcmd"), b"stub").unwrap();

    let script = dir.join("steamcmd.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
    }
}

/// Engine config rooted in a temp dir, tuned for fast tests.
pub fn test_config(root: &Path, max_concurrent: usize) -> SgdConfig {
    SgdConfig {
        download_dir: Some(root.join("downloads")),
        steamcmd_dir: Some(root.join("steamcmd")),
        state_dir: Some(root.join("state")),
        max_concurrent_downloads: max_concurrent,
        auto_install_steamcmd: false,
        spawn_grace_secs: 2,
        stuck_timeout_secs: 60,
        cancel_grace_secs: 2,
        progress_persist_step: 1.0,
        ..SgdConfig::default()
    }
}

/// Catalog that knows every app and calls them all free.
pub struct FreeCatalog;

impl AppCatalog for FreeCatalog {
    fn lookup(&self, app_id: u32) -> anyhow::Result<Option<AppDetails>> {
        Ok(Some(AppDetails {
            app_id,
            name: format!("App {app_id}"),
            is_free: true,
            size_estimate: None,
        }))
    }
}

pub fn free_catalog() -> Arc<dyn AppCatalog> {
    Arc::new(FreeCatalog)
}

/// Poll `cond` until it holds or `timeout` elapses (then panic with `what`).
pub async fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
