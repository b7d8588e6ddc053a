//! Shell integration for the supervisor.
//!
//! Provides idempotent patching of shell rc files so that every interactive
//! session is routed through `supervisor <interpreter>` while the guard
//! marker is unset. Once the supervisor has exec'd the real interpreter with
//! the marker exported, the same rc file runs again and falls through to
//! the user's normal configuration.
//!
//! # Markers
//!
//! Managed blocks are identified by `GUARDIAN-BEGIN` and `GUARDIAN-END`
//! comment markers and always sit at the very top of the rc file, so the
//! hook runs before anything that could crash.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::supervisor::GUARD_ENV;
use crate::{Error, Result};

/// Marker for the start of the guardian-managed block
const GUARDIAN_BEGIN_MARKER: &str = "# GUARDIAN-BEGIN (do not edit this block)";

/// Marker for the end of the guardian-managed block
const GUARDIAN_END_MARKER: &str = "# GUARDIAN-END";

/// Supported interpreter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellType {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// POSIX sh (dash, ash, busybox sh)
    Sh,
}

impl ShellType {
    /// Detect shell type from environment
    #[must_use]
    pub fn detect() -> Option<Self> {
        std::env::var("SHELL")
            .ok()
            .and_then(|s| Self::from_path(&s))
    }

    /// Parse shell type from a path (e.g., "/bin/bash")
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next()?;
        Self::from_name(name)
    }

    /// Parse shell type from name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_start_matches('-').to_lowercase().as_str() {
            "bash" => Some(Self::Bash),
            "zsh" => Some(Self::Zsh),
            "sh" | "dash" | "ash" => Some(Self::Sh),
            _ => None,
        }
    }

    /// Get the rc file path for this shell
    ///
    /// Plain `sh` has no per-user interactive rc file.
    #[must_use]
    pub fn rc_file_path(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        match self {
            Self::Bash => Some(home.join(".bashrc")),
            Self::Zsh => Some(home.join(".zshrc")),
            Self::Sh => None,
        }
    }

    /// Get the display name for this shell
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Sh => "sh",
        }
    }

    /// Arguments that start an interactive session without reading any
    /// startup file.
    #[must_use]
    pub const fn failsafe_args(&self) -> &'static [&'static str] {
        match self {
            Self::Bash => &["--noprofile", "--norc", "-i"],
            Self::Zsh => &["--no-rcs", "--no-globalrcs", "-i"],
            Self::Sh => &["-i"],
        }
    }

    /// Prompt string for the failsafe session.
    #[must_use]
    pub const fn failsafe_prompt(&self) -> &'static str {
        match self {
            Self::Bash => "\\[\\e[1;31m\\][FAILSAFE]\\[\\e[0m\\] \\w\\$ ",
            Self::Zsh => "%B%F{red}[FAILSAFE]%f%b %~%# ",
            Self::Sh => "\x1b[1;31m[FAILSAFE]\x1b[0m $ ",
        }
    }
}

/// Result of a patch operation
#[derive(Debug, Clone)]
pub struct PatchResult {
    /// Path to the rc file that was patched
    pub config_path: PathBuf,
    /// Path to the backup file (if created)
    pub backup_path: Option<PathBuf>,
    /// Whether any changes were made
    pub modified: bool,
    /// Description of what happened
    pub message: String,
}

/// Check if the guardian-managed block is already present
#[must_use]
pub fn has_guardian_block(content: &str) -> bool {
    content.contains(GUARDIAN_BEGIN_MARKER) && content.contains(GUARDIAN_END_MARKER)
}

/// Quote a path for inclusion in a POSIX shell script.
fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Create the managed hook block.
#[must_use]
pub fn create_guardian_block(supervisor: &Path, interpreter: &Path) -> String {
    let supervisor = shell_quote(supervisor);
    let interpreter = shell_quote(interpreter);
    format!(
        r#"{GUARDIAN_BEGIN_MARKER}
# guardian: route interactive sessions through the crash-loop supervisor
if [ -z "${{{GUARD_ENV}:-}}" ] && [ -x {supervisor} ]; then
    case $- in
        *i*) exec {supervisor} {interpreter} ;;
    esac
fi
{GUARDIAN_END_MARKER}"#
    )
}

/// Locate the shell rc file for the given shell type
pub fn locate_shell_rc(shell: ShellType) -> Result<PathBuf> {
    shell.rc_file_path().ok_or_else(|| {
        Error::SetupError(format!(
            "Could not determine an rc file for {}",
            shell.name()
        ))
    })
}

/// Create a backup of the rc file
///
/// Backup is named `<original>.bak.<timestamp>`
fn create_backup(config_path: &Path) -> Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let backup_name = format!(
        "{}.bak.{}",
        config_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy(),
        timestamp
    );
    let backup_path = config_path.with_file_name(backup_name);

    fs::copy(config_path, &backup_path).map_err(|e| {
        Error::SetupError(format!(
            "Failed to create backup at {}: {}",
            backup_path.display(),
            e
        ))
    })?;

    Ok(backup_path)
}

/// Idempotently prepend the supervisor hook to a shell rc file
///
/// # Behavior
///
/// - If the managed block is already present, returns without modification
/// - If the block is missing, creates a backup and prepends the block
/// - Creates the rc file (and parent directories) if it doesn't exist
pub fn patch_shell_rc_at(
    rc_path: &Path,
    supervisor: &Path,
    interpreter: &Path,
) -> Result<PatchResult> {
    let content = if rc_path.exists() {
        fs::read_to_string(rc_path).map_err(|e| {
            Error::SetupError(format!("Failed to read {}: {}", rc_path.display(), e))
        })?
    } else {
        String::new()
    };

    if has_guardian_block(&content) {
        return Ok(PatchResult {
            config_path: rc_path.to_path_buf(),
            backup_path: None,
            modified: false,
            message: format!(
                "{} already routes through the supervisor. No changes needed.",
                rc_path.display()
            ),
        });
    }

    let backup_path = if rc_path.exists() {
        Some(create_backup(rc_path)?)
    } else {
        if let Some(parent) = rc_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::SetupError(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        None
    };

    let block = create_guardian_block(supervisor, interpreter);
    let new_content = if content.is_empty() {
        format!("{block}\n")
    } else {
        format!("{block}\n\n{content}")
    };

    fs::write(rc_path, &new_content)
        .map_err(|e| Error::SetupError(format!("Failed to write {}: {}", rc_path.display(), e)))?;

    let message = match &backup_path {
        Some(bp) => format!(
            "Added supervisor hook to {}. Backup saved to {}",
            rc_path.display(),
            bp.display()
        ),
        None => format!("Created {} with supervisor hook", rc_path.display()),
    };

    Ok(PatchResult {
        config_path: rc_path.to_path_buf(),
        backup_path,
        modified: true,
        message,
    })
}

/// Remove the guardian-managed block from a shell rc file
pub fn unpatch_shell_rc_at(rc_path: &Path) -> Result<PatchResult> {
    if !rc_path.exists() {
        return Ok(PatchResult {
            config_path: rc_path.to_path_buf(),
            backup_path: None,
            modified: false,
            message: format!("{} does not exist. No changes needed.", rc_path.display()),
        });
    }

    let content = fs::read_to_string(rc_path)
        .map_err(|e| Error::SetupError(format!("Failed to read {}: {}", rc_path.display(), e)))?;

    let (Some(begin_idx), Some(end_marker_start)) = (
        content.find(GUARDIAN_BEGIN_MARKER),
        content.find(GUARDIAN_END_MARKER),
    ) else {
        return Ok(PatchResult {
            config_path: rc_path.to_path_buf(),
            backup_path: None,
            modified: false,
            message: format!(
                "{} does not contain a supervisor hook. No changes needed.",
                rc_path.display()
            ),
        });
    };

    let backup_path = create_backup(rc_path)?;

    let mut end_idx = content[end_marker_start..]
        .find('\n')
        .map_or(content.len(), |i| end_marker_start + i + 1);
    // Swallow the blank separator line added on patch
    while end_idx < content.len() && content.as_bytes()[end_idx] == b'\n' {
        end_idx += 1;
    }

    let new_content = format!("{}{}", &content[..begin_idx], &content[end_idx..]);

    fs::write(rc_path, &new_content)
        .map_err(|e| Error::SetupError(format!("Failed to write {}: {}", rc_path.display(), e)))?;

    Ok(PatchResult {
        config_path: rc_path.to_path_buf(),
        backup_path: Some(backup_path.clone()),
        modified: true,
        message: format!(
            "Removed supervisor hook from {}. Backup saved to {}",
            rc_path.display(),
            backup_path.display()
        ),
    })
}
