//! The failsafe environment.
//!
//! A bare interactive shell: fixed PATH, no startup files, a red
//! `[FAILSAFE]` prompt, and markers in the environment so that nested
//! supervisor invocations pass straight through. The environment is rebuilt
//! from scratch; only identity, terminal, and locale variables survive.
//! Candidate shells are tried in order until one execs.

use std::ffi::{OsStr, OsString};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::FailsafeConfig;
use crate::setup::ShellType;
use crate::supervisor::{FAILSAFE_ENV, FAILSAFE_REASON_ENV, GUARD_ENV};

/// Exit status when nothing at all could be exec'd.
pub const EXIT_NO_SHELL: i32 = 127;

/// Inherited variables passed into the failsafe shell. Everything else,
/// exported functions and loader hooks included, is dropped.
const KEPT_ENV: [&str; 5] = ["HOME", "USER", "LOGNAME", "TERM", "LANG"];

/// Locale categories (`LC_ALL`, `LC_CTYPE`, ...) are kept too.
const KEPT_ENV_PREFIX: &str = "LC_";

const DEFAULT_TERM: &str = "xterm-256color";

/// Last-resort shells, in order.
const FALLBACK_SHELLS: [&str; 2] = ["/bin/bash", "/bin/sh"];

/// Why the supervisor diverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailsafeReason {
    CrashLoop,
    InterpreterMissing { program: String, error: String },
}

impl FailsafeReason {
    /// Stable identifier exported as `SUPERVISOR_FAILSAFE_REASON`.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CrashLoop => "crash_loop",
            Self::InterpreterMissing { .. } => "interpreter_missing",
        }
    }

    /// One-line explanation for the banner.
    #[must_use]
    pub fn headline(&self) -> String {
        match self {
            Self::CrashLoop => "crash loop detected".to_string(),
            Self::InterpreterMissing { program, error } => {
                format!("interpreter missing: {program} ({error})")
            }
        }
    }
}

/// A shell the failsafe environment may exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailsafeShell {
    pub path: PathBuf,
    pub kind: ShellType,
}

impl FailsafeShell {
    fn new(path: PathBuf, kind: ShellType) -> Self {
        Self { path, kind }
    }
}

/// Candidate shells: configured shell, then `$SHELL` if it is a supported
/// type, then `/bin/bash`, then `/bin/sh`. Duplicates are dropped.
#[must_use]
pub fn candidates(configured: Option<&Path>, env_shell: Option<&OsStr>) -> Vec<FailsafeShell> {
    let mut out: Vec<FailsafeShell> = Vec::new();
    let mut push = |shell: FailsafeShell| {
        if !out.iter().any(|s| s.path == shell.path) {
            out.push(shell);
        }
    };

    if let Some(path) = configured {
        // Unknown shells still get the portable `-i`
        let kind = ShellType::from_path(&path.to_string_lossy()).unwrap_or(ShellType::Sh);
        push(FailsafeShell::new(path.to_path_buf(), kind));
    }
    if let Some(shell) = env_shell.filter(|s| !s.is_empty()) {
        if let Some(kind) = ShellType::from_path(&shell.to_string_lossy()) {
            push(FailsafeShell::new(PathBuf::from(shell), kind));
        }
    }
    for path in FALLBACK_SHELLS {
        if let Some(kind) = ShellType::from_path(path) {
            push(FailsafeShell::new(PathBuf::from(path), kind));
        }
    }
    out
}

/// Whether an inherited variable may reach the failsafe shell.
fn is_kept(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    KEPT_ENV.iter().any(|kept| *kept == name) || name.starts_with(KEPT_ENV_PREFIX)
}

/// Build the command for one candidate from the caller's environment.
#[must_use]
pub fn failsafe_command<I>(
    shell: &FailsafeShell,
    reason: &FailsafeReason,
    cfg: &FailsafeConfig,
    inherited: I,
) -> Command
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut cmd = Command::new(&shell.path);
    cmd.args(shell.kind.failsafe_args()).env_clear();
    for (name, value) in inherited {
        if is_kept(&name) && !value.is_empty() {
            cmd.env(name, value);
        }
    }
    if cmd.get_envs().all(|(name, _)| name != "TERM") {
        cmd.env("TERM", DEFAULT_TERM);
    }
    cmd.env("PATH", &cfg.path)
        .env("PS1", shell.kind.failsafe_prompt())
        .env(GUARD_ENV, "1")
        .env(FAILSAFE_ENV, "1")
        .env(FAILSAFE_REASON_ENV, reason.code());
    cmd
}

/// Text printed on stderr before the failsafe shell starts.
#[must_use]
pub fn banner(reason: &FailsafeReason, crash_log: &Path, color: bool) -> String {
    let (red, bold, reset) = if color {
        ("\x1b[1;31m", "\x1b[1m", "\x1b[0m")
    } else {
        ("", "", "")
    };
    format!(
        "{red}[FAILSAFE]{reset} {bold}{headline}{reset}\n\
         Startup files were skipped and PATH is fixed to the system defaults.\n\
         Crash log: {log}\n\
         {FAILSAFE_ENV}=1 is set in this session. Fix your shell configuration, then open a new terminal.\n",
        headline = reason.headline(),
        log = crash_log.display(),
    )
}

/// Colour unless `NO_COLOR` is set or stderr is not a terminal.
fn use_color() -> bool {
    std::env::var_os("NO_COLOR").is_none_or(|v| v.is_empty()) && std::io::stderr().is_terminal()
}

/// Print the banner and exec the first shell that starts.
///
/// Returns only if every candidate failed, with the exit status to use.
#[cfg(unix)]
pub fn enter(reason: &FailsafeReason, cfg: &FailsafeConfig, crash_log: &Path) -> i32 {
    use std::os::unix::process::CommandExt;

    eprint!("{}", banner(reason, crash_log, use_color()));
    tracing::warn!(reason = reason.code(), "Entering failsafe environment");

    let env_shell = std::env::var_os("SHELL");
    let inherited: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    for shell in candidates(cfg.shell.as_deref(), env_shell.as_deref()) {
        let err = failsafe_command(&shell, reason, cfg, inherited.iter().cloned()).exec();
        tracing::warn!(shell = %shell.path.display(), error = %err, "Failsafe shell failed to start");
    }

    eprintln!("guardian: no failsafe shell could be started; tried configured shell, $SHELL, /bin/bash, /bin/sh");
    EXIT_NO_SHELL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(cmd: &Command) -> Vec<(String, Option<String>)> {
        cmd.get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect()
    }

    fn lookup(cmd: &Command, key: &str) -> Option<Option<String>> {
        env_of(cmd).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn candidate_order_and_dedup() {
        let list = candidates(
            Some(Path::new("/usr/local/bin/zsh")),
            Some(OsStr::new("/bin/bash")),
        );
        let paths: Vec<_> = list.iter().map(|s| s.path.display().to_string()).collect();
        assert_eq!(paths, vec!["/usr/local/bin/zsh", "/bin/bash", "/bin/sh"]);
        assert_eq!(list[0].kind, ShellType::Zsh);
    }

    #[test]
    fn unsupported_env_shell_is_skipped() {
        let list = candidates(None, Some(OsStr::new("/usr/bin/fish")));
        let paths: Vec<_> = list.iter().map(|s| s.path.display().to_string()).collect();
        assert_eq!(paths, vec!["/bin/bash", "/bin/sh"]);
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn command_rebuilds_env_from_allowlist() {
        let shell = FailsafeShell::new(PathBuf::from("/bin/bash"), ShellType::Bash);
        let cmd = failsafe_command(
            &shell,
            &FailsafeReason::CrashLoop,
            &FailsafeConfig::default(),
            vars(&[
                ("HOME", "/home/u"),
                ("LC_ALL", "C.UTF-8"),
                ("BASH_FUNC_ls%%", "() { echo hijacked; }"),
                ("LD_PRELOAD", "/tmp/evil.so"),
                ("BASH_ENV", "/tmp/rc"),
                ("SHELLOPTS", "xtrace"),
                ("PATH", "/broken"),
            ]),
        );
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--noprofile", "--norc", "-i"]);

        for var in ["BASH_FUNC_ls%%", "LD_PRELOAD", "BASH_ENV", "SHELLOPTS"] {
            assert_eq!(lookup(&cmd, var), None, "{var} should not be passed");
        }
        assert_eq!(lookup(&cmd, "HOME"), Some(Some("/home/u".to_string())));
        assert_eq!(lookup(&cmd, "LC_ALL"), Some(Some("C.UTF-8".to_string())));
        assert_eq!(
            lookup(&cmd, "PATH"),
            Some(Some(crate::config::DEFAULT_FAILSAFE_PATH.to_string()))
        );
        assert_eq!(lookup(&cmd, "TERM"), Some(Some(DEFAULT_TERM.to_string())));
        assert_eq!(lookup(&cmd, GUARD_ENV), Some(Some("1".to_string())));
        assert_eq!(lookup(&cmd, FAILSAFE_ENV), Some(Some("1".to_string())));
        assert_eq!(
            lookup(&cmd, FAILSAFE_REASON_ENV),
            Some(Some("crash_loop".to_string()))
        );
        assert!(lookup(&cmd, "PS1").unwrap().unwrap().contains("[FAILSAFE]"));
    }

    #[test]
    fn existing_term_is_kept() {
        let shell = FailsafeShell::new(PathBuf::from("/bin/sh"), ShellType::Sh);
        let reason = FailsafeReason::InterpreterMissing {
            program: "/bin/nope".into(),
            error: "No such file or directory".into(),
        };
        let cmd = failsafe_command(
            &shell,
            &reason,
            &FailsafeConfig::default(),
            vars(&[("TERM", "screen")]),
        );
        assert_eq!(lookup(&cmd, "TERM"), Some(Some("screen".to_string())));
        assert_eq!(
            lookup(&cmd, FAILSAFE_REASON_ENV),
            Some(Some("interpreter_missing".to_string()))
        );
    }

    #[test]
    fn banner_names_reason_and_log() {
        let text = banner(
            &FailsafeReason::CrashLoop,
            Path::new("/state/crash.log"),
            false,
        );
        assert!(text.starts_with("[FAILSAFE] crash loop detected"));
        assert!(text.contains("/state/crash.log"));
        assert!(text.contains("SUPERVISOR_FAILSAFE=1"));
        assert!(!text.contains('\x1b'));

        let colored = banner(&FailsafeReason::CrashLoop, Path::new("/x"), true);
        assert!(colored.contains("\x1b[1;31m"));
    }

    #[test]
    fn interpreter_missing_headline_is_distinct() {
        let reason = FailsafeReason::InterpreterMissing {
            program: "/opt/zsh".into(),
            error: "not found".into(),
        };
        assert_eq!(reason.headline(), "interpreter missing: /opt/zsh (not found)");
        assert_ne!(reason.headline(), FailsafeReason::CrashLoop.headline());
    }
}
