//! SteamCMD: locating the tool and building invocations.
//!
//! The invocation contract (order matters to the tool):
//! `+login …`, `+force_install_dir <dir>`, optional platform override,
//! `+app_update <id> [validate]`, `+quit`. Secrets go into the argv only;
//! anything logged goes through `Invocation::redacted`.

mod install;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::DownloadError;
use crate::job::{Credentials, Platform};

/// Handle to a SteamCMD installation directory.
#[derive(Debug, Clone)]
pub struct SteamCmd {
    dir: PathBuf,
    auto_install: bool,
}

impl SteamCmd {
    pub fn new(dir: PathBuf, auto_install: bool) -> Self {
        Self { dir, auto_install }
    }

    /// The entry script the engine executes.
    pub fn script_path(&self) -> PathBuf {
        self.dir.join("steamcmd.sh")
    }

    fn binary_path(&self) -> PathBuf {
        self.dir.join("linux32").join("steamcmd")
    }

    /// Both the wrapper script and the 32-bit binary must be present;
    /// a half-extracted archive is not an installation.
    pub fn is_installed(&self) -> bool {
        self.script_path().exists() && self.binary_path().exists()
    }

    /// Return the script path, installing the tool first if it is missing
    /// and auto-install is enabled.
    pub async fn ensure_installed(&self) -> Result<PathBuf, DownloadError> {
        if self.is_installed() {
            return Ok(self.script_path());
        }
        if !self.auto_install {
            return Err(DownloadError::ToolMissing(format!(
                "steamcmd not found at {} and auto-install is disabled",
                self.script_path().display()
            )));
        }
        tracing::info!(dir = %self.dir.display(), "steamcmd missing, installing");
        install::install_into(&self.dir)
            .await
            .map_err(|e| DownloadError::ToolMissing(format!("{e:#}")))?;
        if !self.is_installed() {
            return Err(DownloadError::ToolMissing(format!(
                "steamcmd still incomplete after install at {}",
                self.dir.display()
            )));
        }
        Ok(self.script_path())
    }
}

/// One fully-specified SteamCMD run for one job.
#[derive(Debug)]
pub struct Invocation {
    script: PathBuf,
    credentials: Credentials,
    install_dir: PathBuf,
    platform: Platform,
    app_id: u32,
    validate: bool,
}

impl Invocation {
    pub fn new(
        script: PathBuf,
        credentials: Credentials,
        install_dir: PathBuf,
        platform: Platform,
        app_id: u32,
        validate: bool,
    ) -> Self {
        Self {
            script,
            credentials,
            install_dir,
            platform,
            app_id,
            validate,
        }
    }

    /// Argument vector in contract order. Secrets appear here and nowhere else.
    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        match &self.credentials {
            Credentials::Anonymous => {
                args.push("+login".into());
                args.push("anonymous".into());
            }
            Credentials::Account {
                username,
                password,
                guard_code,
            } => {
                args.push("+login".into());
                args.push(username.clone());
                // Empty password means "use the cached session" (recovered
                // jobs); SteamCMD accepts a bare username then.
                if !password.is_empty() {
                    args.push(password.clone());
                    if let Some(code) = guard_code {
                        args.push(code.clone());
                    }
                }
            }
        }

        args.push("+force_install_dir".into());
        args.push(self.install_dir.to_string_lossy().into_owned());

        if self.platform != Platform::Windows {
            args.push("+@sSteamCmdForcePlatformType".into());
            args.push(self.platform.as_steam_str().into());
        }

        args.push("+app_update".into());
        args.push(self.app_id.to_string());
        if self.validate {
            args.push("validate".into());
        }

        args.push("+quit".into());
        args
    }

    /// Command-line rendering safe for logs: password and guard code masked.
    pub fn redacted(&self) -> String {
        let mut shown = vec![self.script.to_string_lossy().into_owned()];
        let args = self.args();
        let mut i = 0;
        while i < args.len() {
            if args[i] == "+login" && args.get(i + 1).map(String::as_str) != Some("anonymous") {
                shown.push(args[i].clone());
                if let Some(user) = args.get(i + 1) {
                    shown.push(user.clone());
                }
                // Everything between the username and the next +command is secret.
                let mut j = i + 2;
                while j < args.len() && !args[j].starts_with('+') {
                    shown.push("****".into());
                    j += 1;
                }
                i = j;
            } else {
                shown.push(args[i].clone());
                i += 1;
            }
        }
        shown.join(" ")
    }

    /// Build the child-process command: stdout/stderr piped, no stdin.
    /// `kill_on_drop` so an abandoned handle cannot leak a live process.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.script);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Fix the execute bit on the entry script (tar archives usually carry it,
/// re-extraction through other channels may not).
#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
