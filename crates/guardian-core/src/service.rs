//! Registration of `supervisor-keeper service` with the host's
//! restart-always supervision:
//! - **Linux**: systemd user unit in `~/.config/systemd/user/`
//! - **macOS**: launchd agent in `~/Library/LaunchAgents/` with `KeepAlive`

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::CONFIG_ENV;

/// Current state of the keeper service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::NotInstalled => write!(f, "not installed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a service operation.
#[derive(Debug)]
pub struct ServiceResult {
    pub success: bool,
    pub message: String,
}

impl ServiceResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// What the service runs.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Absolute path of the `supervisor-keeper` binary.
    pub keeper_binary: PathBuf,
    /// Explicit config file to pass through `GUARDIAN_CONFIG`.
    pub config_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Install and start the keeper service.
#[must_use]
pub fn install(spec: &ServiceSpec) -> ServiceResult {
    if cfg!(target_os = "macos") {
        install_launchd(spec)
    } else if cfg!(target_os = "linux") {
        install_systemd(spec)
    } else {
        ServiceResult::fail("service installation not supported on this platform")
    }
}

/// Stop and remove the keeper service.
#[must_use]
pub fn uninstall() -> ServiceResult {
    if cfg!(target_os = "macos") {
        uninstall_launchd()
    } else if cfg!(target_os = "linux") {
        uninstall_systemd()
    } else {
        ServiceResult::fail("service uninstall not supported on this platform")
    }
}

/// Query current service status.
#[must_use]
pub fn status() -> ServiceStatus {
    if cfg!(target_os = "macos") {
        status_launchd()
    } else if cfg!(target_os = "linux") {
        status_systemd()
    } else {
        ServiceStatus::Unknown
    }
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn write_file(path: &Path, content: &str, what: &str) -> Result<(), ServiceResult> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ServiceResult::fail(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(path, content)
        .map_err(|e| ServiceResult::fail(format!("failed to write {what}: {e}")))
}

// ---------------------------------------------------------------------------
// macOS: launchd
// ---------------------------------------------------------------------------

const LAUNCHD_LABEL: &str = "dev.guardian.keeper";

fn launchd_plist_path() -> PathBuf {
    home()
        .join("Library")
        .join("LaunchAgents")
        .join(format!("{LAUNCHD_LABEL}.plist"))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Generate the launchd agent plist.
#[must_use]
pub fn generate_launchd_plist(spec: &ServiceSpec) -> String {
    let binary = xml_escape(&spec.keeper_binary.to_string_lossy());
    let env = spec.config_path.as_ref().map_or_else(String::new, |path| {
        format!(
            "    <key>EnvironmentVariables</key>\n    <dict>\n        <key>{CONFIG_ENV}</key>\n        <string>{}</string>\n    </dict>\n",
            xml_escape(&path.to_string_lossy())
        )
    });
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{binary}</string>
        <string>service</string>
    </array>
{env}    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>ThrottleInterval</key>
    <integer>10</integer>
</dict>
</plist>
"#
    )
}

fn install_launchd(spec: &ServiceSpec) -> ServiceResult {
    let plist_path = launchd_plist_path();
    if let Err(failure) = write_file(&plist_path, &generate_launchd_plist(spec), "plist") {
        return failure;
    }

    let output = Command::new("launchctl")
        .args(["load", "-w"])
        .arg(&plist_path)
        .output();

    match output {
        Ok(o) if o.status.success() => {
            ServiceResult::ok(format!("installed and loaded: {}", plist_path.display()))
        }
        Ok(o) => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            if stderr.contains("already loaded") {
                ServiceResult::ok(format!(
                    "plist written (service was already loaded): {}",
                    plist_path.display()
                ))
            } else {
                ServiceResult::fail(format!("plist written but launchctl load failed: {stderr}"))
            }
        }
        Err(e) => ServiceResult::fail(format!("plist written but failed to run launchctl: {e}")),
    }
}

fn uninstall_launchd() -> ServiceResult {
    let plist_path = launchd_plist_path();
    if !plist_path.exists() {
        return ServiceResult::ok("service not installed (no plist found)");
    }

    let _ = Command::new("launchctl")
        .args(["unload", "-w"])
        .arg(&plist_path)
        .output();

    match std::fs::remove_file(&plist_path) {
        Ok(()) => ServiceResult::ok("service uninstalled"),
        Err(e) => ServiceResult::fail(format!("failed to remove plist: {e}")),
    }
}

fn status_launchd() -> ServiceStatus {
    if !launchd_plist_path().exists() {
        return ServiceStatus::NotInstalled;
    }

    let output = Command::new("launchctl")
        .args(["list", LAUNCHD_LABEL])
        .output();

    match output {
        // `launchctl list <label>` prints a dict with a "PID" key while running
        Ok(o) if o.status.success() => {
            if String::from_utf8_lossy(&o.stdout).contains("\"PID\"") {
                ServiceStatus::Running
            } else {
                ServiceStatus::Stopped
            }
        }
        Ok(_) => ServiceStatus::Stopped,
        Err(_) => ServiceStatus::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Linux: systemd
// ---------------------------------------------------------------------------

const SYSTEMD_UNIT_NAME: &str = "supervisor-keeper.service";

fn systemd_unit_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home().join(".config"))
        .join("systemd")
        .join("user")
        .join(SYSTEMD_UNIT_NAME)
}

fn systemd_quote(s: &str) -> String {
    if s.contains(char::is_whitespace) || s.contains('"') {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

/// Generate the systemd user unit.
#[must_use]
pub fn generate_systemd_unit(spec: &ServiceSpec) -> String {
    let binary = systemd_quote(&spec.keeper_binary.to_string_lossy());
    let env = spec.config_path.as_ref().map_or_else(String::new, |path| {
        format!(
            "Environment={}\n",
            systemd_quote(&format!("{CONFIG_ENV}={}", path.to_string_lossy()))
        )
    });
    format!(
        r"[Unit]
Description=Supervisor replica keeper

[Service]
Type=simple
ExecStart={binary} service
{env}Restart=always
RestartSec=5

NoNewPrivileges=yes

[Install]
WantedBy=default.target
"
    )
}

fn install_systemd(spec: &ServiceSpec) -> ServiceResult {
    let unit_path = systemd_unit_path();
    if let Err(failure) = write_file(&unit_path, &generate_systemd_unit(spec), "unit file") {
        return failure;
    }

    if let Err(e) = Command::new("systemctl")
        .args(["--user", "daemon-reload"])
        .output()
    {
        return ServiceResult::fail(format!(
            "unit file written but systemctl daemon-reload failed: {e}"
        ));
    }

    let enable = Command::new("systemctl")
        .args(["--user", "enable", "--now", SYSTEMD_UNIT_NAME])
        .output();

    match enable {
        Ok(o) if o.status.success() => {
            ServiceResult::ok(format!("installed and started: {}", unit_path.display()))
        }
        Ok(o) => ServiceResult::fail(format!(
            "unit written but enable failed: {}",
            String::from_utf8_lossy(&o.stderr)
        )),
        Err(e) => ServiceResult::fail(format!("unit written but failed to run systemctl: {e}")),
    }
}

fn uninstall_systemd() -> ServiceResult {
    let unit_path = systemd_unit_path();
    if !unit_path.exists() {
        return ServiceResult::ok("service not installed");
    }

    let _ = Command::new("systemctl")
        .args(["--user", "disable", "--now", SYSTEMD_UNIT_NAME])
        .output();

    if let Err(e) = std::fs::remove_file(&unit_path) {
        return ServiceResult::fail(format!("failed to remove unit file: {e}"));
    }

    let _ = Command::new("systemctl")
        .args(["--user", "daemon-reload"])
        .output();

    ServiceResult::ok("service uninstalled")
}

fn status_systemd() -> ServiceStatus {
    if !systemd_unit_path().exists() {
        return ServiceStatus::NotInstalled;
    }

    let output = Command::new("systemctl")
        .args(["--user", "is-active", SYSTEMD_UNIT_NAME])
        .output();

    match output {
        Ok(o) => match String::from_utf8_lossy(&o.stdout).trim() {
            "active" | "activating" => ServiceStatus::Running,
            "inactive" | "failed" | "deactivating" => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown,
        },
        Err(_) => ServiceStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(config: Option<&str>) -> ServiceSpec {
        ServiceSpec {
            keeper_binary: PathBuf::from("/home/u/.local/bin/supervisor-keeper"),
            config_path: config.map(PathBuf::from),
        }
    }

    #[test]
    fn unit_restarts_always_and_runs_service() {
        let unit = generate_systemd_unit(&spec(None));
        assert!(unit.contains("[Unit]"));
        assert!(unit.contains("[Service]"));
        assert!(unit.contains("[Install]"));
        assert!(unit.contains("ExecStart=/home/u/.local/bin/supervisor-keeper service"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("WantedBy=default.target"));
        assert!(!unit.contains("Environment="));
    }

    #[test]
    fn unit_passes_config_path() {
        let unit = generate_systemd_unit(&spec(Some("/etc/my guardian.toml")));
        assert!(unit.contains("Environment=\"GUARDIAN_CONFIG=/etc/my guardian.toml\""));
    }

    #[test]
    fn plist_keeps_alive() {
        let plist = generate_launchd_plist(&spec(Some("/a&b/guardian.toml")));
        assert!(plist.contains("<string>dev.guardian.keeper</string>"));
        assert!(plist.contains("<string>/home/u/.local/bin/supervisor-keeper</string>"));
        assert!(plist.contains("<string>service</string>"));
        assert!(plist.contains("<key>KeepAlive</key>\n    <true/>"));
        assert!(plist.contains("<string>/a&amp;b/guardian.toml</string>"));
    }

    #[test]
    fn paths_are_valid() {
        assert!(launchd_plist_path().ends_with("Library/LaunchAgents/dev.guardian.keeper.plist"));
        assert!(systemd_unit_path().ends_with("systemd/user/supervisor-keeper.service"));
    }

    #[test]
    fn service_status_display() {
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        assert_eq!(ServiceStatus::NotInstalled.to_string(), "not installed");
    }
}
