//! SteamCMD installation: fetch the official archive and unpack it.
//!
//! Used lazily by a supervisor when the tool is missing and auto-install
//! is enabled. Downloads to a temp staging dir, extracts with `tar`, then
//! fixes permissions. Interrupted installs leave only the staging dir
//! behind, never a half-written install.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const STEAMCMD_ARCHIVE_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz";

/// Install SteamCMD into `dir` (created if needed).
pub(super) async fn install_into(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create steamcmd dir: {}", dir.display()))?;

    let staging = tempfile::tempdir_in(dir).context("create staging dir")?;
    let archive = staging.path().join("steamcmd_linux.tar.gz");

    let archive_for_fetch = archive.clone();
    tokio::task::spawn_blocking(move || fetch_archive(STEAMCMD_ARCHIVE_URL, &archive_for_fetch))
        .await
        .context("archive download task join")?
        .context("download steamcmd archive")?;

    extract_archive(&archive, dir).await?;

    let script = dir.join("steamcmd.sh");
    super::make_executable(&script)
        .with_context(|| format!("set execute bit: {}", script.display()))?;

    // Some mirrors ship the binary at the archive root instead of linux32/.
    let linux32_bin = dir.join("linux32").join("steamcmd");
    let root_bin = dir.join("steamcmd");
    if !linux32_bin.exists() && root_bin.exists() {
        tokio::fs::create_dir_all(dir.join("linux32")).await?;
        tokio::fs::copy(&root_bin, &linux32_bin)
            .await
            .context("relocate steamcmd binary into linux32/")?;
        super::make_executable(&linux32_bin)?;
    }

    tracing::info!(dir = %dir.display(), "steamcmd installed");
    Ok(())
}

/// Blocking download of `url` into `dest`. Call from `spawn_blocking`.
fn fetch_archive(url: &str, dest: &Path) -> Result<()> {
    let mut file = std::fs::File::create(dest)
        .with_context(|| format!("create archive file: {}", dest.display()))?;

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(15))?;
    easy.timeout(Duration::from_secs(300))?;

    let mut write_err: Option<std::io::Error> = None;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| match file.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                write_err = Some(e);
                Ok(0)
            }
        })?;
        transfer.perform().context("archive download failed")?;
    }
    if let Some(e) = write_err {
        return Err(e).context("write archive to disk");
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        bail!("GET {} returned HTTP {}", url, code);
    }
    Ok(())
}

/// Unpack the tarball with the system `tar` (always present on the
/// platforms SteamCMD itself supports).
async fn extract_archive(archive: &Path, dir: &Path) -> Result<()> {
    let status = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dir)
        .status()
        .await
        .context("run tar")?;
    if !status.success() {
        bail!(
            "tar -xzf {} failed with {}",
            archive.display(),
            status
        );
    }
    Ok(())
}
