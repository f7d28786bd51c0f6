//! Store catalog lookups.
//!
//! The engine only needs two things from the catalog: a display name for
//! the job and whether the app is free (anonymous logins can only fetch
//! free apps). Everything else the store API returns is ignored.

use anyhow::{Context, Result};
use std::time::Duration;

/// What the engine keeps from an `appdetails` response.
#[derive(Debug, Clone)]
pub struct AppDetails {
    pub app_id: u32,
    pub name: String,
    pub is_free: bool,
    /// Rough install size in bytes, when the catalog reports one.
    pub size_estimate: Option<u64>,
}

/// Catalog boundary. `lookup` is blocking; async callers go through
/// `spawn_blocking`. `Ok(None)` means the catalog positively knows no such
/// app exists; transport failures are `Err`.
pub trait AppCatalog: Send + Sync {
    fn lookup(&self, app_id: u32) -> Result<Option<AppDetails>>;
}

/// Production catalog: the Steam store `appdetails` endpoint.
#[derive(Debug, Default)]
pub struct SteamStoreCatalog;

const STORE_API_BASE: &str = "https://store.steampowered.com/api";

impl AppCatalog for SteamStoreCatalog {
    fn lookup(&self, app_id: u32) -> Result<Option<AppDetails>> {
        let url = format!("{STORE_API_BASE}/appdetails?appids={app_id}");
        let body = http_get(&url)?;
        parse_appdetails(app_id, &body)
    }
}

/// GET a URL into memory. Runs on the current thread; call from
/// `spawn_blocking` in async code.
fn http_get(url: &str) -> Result<Vec<u8>> {
    let mut body: Vec<u8> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(15))?;
    easy.timeout(Duration::from_secs(30))?;

    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform().context("catalog request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        anyhow::bail!("GET {} returned HTTP {}", url, code);
    }

    Ok(body)
}

/// Parse the store response: `{"<appid>": {"success": bool, "data": {...}}}`.
/// `success: false` means the app does not exist (or is hidden) -> Ok(None).
fn parse_appdetails(app_id: u32, body: &[u8]) -> Result<Option<AppDetails>> {
    let root: serde_json::Value =
        serde_json::from_slice(body).context("catalog response is not JSON")?;
    let entry = root
        .get(app_id.to_string())
        .context("catalog response missing app entry")?;

    if !entry.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Ok(None);
    }
    let data = entry.get("data").context("catalog entry missing data")?;

    let name = data
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let is_free = data
        .get("is_free")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let size_estimate = data
        .get("file_size")
        .and_then(|v| v.as_u64());

    Ok(Some(AppDetails {
        app_id,
        name,
        is_free,
        size_estimate,
    }))
}
