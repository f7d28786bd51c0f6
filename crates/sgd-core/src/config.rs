use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration loaded from `~/.config/sgd/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Where apps are installed (one subdirectory per job).
    /// None = `<XDG data home>/sgd/downloads`.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Directory holding `steamcmd.sh`. None = `<XDG data home>/sgd/steamcmd`.
    #[serde(default)]
    pub steamcmd_dir: Option<PathBuf>,
    /// Where the job database lives. None = `<XDG state home>/sgd`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Maximum jobs downloading at once.
    pub max_concurrent_downloads: usize,
    /// Ask SteamCMD to validate files when the caller doesn't say.
    pub validate_by_default: bool,
    /// Terminal jobs kept before the oldest are evicted.
    pub history_cap: usize,
    /// Download and extract SteamCMD automatically when missing.
    pub auto_install_steamcmd: bool,
    /// Seconds a spawned process may stay silent before it is considered
    /// downloading anyway (Starting -> Downloading promotion).
    pub spawn_grace_secs: u64,
    /// Seconds with no output at all before a job is declared stuck.
    pub stuck_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when cancelling.
    pub cancel_grace_secs: u64,
    /// Persist progress-only updates every this many percent.
    pub progress_persist_step: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            steamcmd_dir: None,
            state_dir: None,
            max_concurrent_downloads: 1,
            validate_by_default: true,
            history_cap: 50,
            auto_install_steamcmd: true,
            spawn_grace_secs: 10,
            stuck_timeout_secs: 300,
            cancel_grace_secs: 5,
            progress_persist_step: 5.0,
        }
    }
}

impl SgdConfig {
    pub fn download_dir(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("sgd")?;
                Ok(xdg_dirs.get_data_home().join("downloads"))
            }
        }
    }

    pub fn steamcmd_dir(&self) -> Result<PathBuf> {
        match &self.steamcmd_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("sgd")?;
                Ok(xdg_dirs.get_data_home().join("steamcmd"))
            }
        }
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("sgd")?;
                Ok(xdg_dirs.get_state_home())
            }
        }
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_secs(self.spawn_grace_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sgd")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SgdConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SgdConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SgdConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = SgdConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 1);
        assert_eq!(cfg.history_cap, 50);
        assert!(cfg.validate_by_default);
        assert!(cfg.auto_install_steamcmd);
        assert_eq!(cfg.stuck_timeout_secs, 300);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = SgdConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: SgdConfig = toml::from_str(&toml).unwrap();
        assert_eq!(
            parsed.max_concurrent_downloads,
            cfg.max_concurrent_downloads
        );
        assert_eq!(parsed.history_cap, cfg.history_cap);
        assert_eq!(parsed.spawn_grace_secs, cfg.spawn_grace_secs);
        assert!(parsed.download_dir.is_none());
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            download_dir = "/data/games"
            steamcmd_dir = "/opt/steamcmd"
            max_concurrent_downloads = 3
            validate_by_default = false
            history_cap = 10
            auto_install_steamcmd = false
            spawn_grace_secs = 5
            stuck_timeout_secs = 60
            cancel_grace_secs = 2
            progress_persist_step = 10.0
        "#;
        let cfg: SgdConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.download_dir().unwrap(), PathBuf::from("/data/games"));
        assert_eq!(cfg.steamcmd_dir().unwrap(), PathBuf::from("/opt/steamcmd"));
        assert!(!cfg.validate_by_default);
        assert_eq!(cfg.history_cap, 10);
        assert_eq!(cfg.stuck_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.cancel_grace(), Duration::from_secs(2));
    }
}
