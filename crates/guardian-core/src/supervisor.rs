//! Launch supervisor state machine.
//!
//! Every invocation ends in exactly one of three ways:
//!
//! - **Passthrough**: the guard marker is already set, so exec the target
//!   without touching the crash log.
//! - **Normal**: record the launch, find no crash loop, exec the target with
//!   the guard marker exported.
//! - **Failsafe**: record the launch, detect a crash loop (or fail to exec
//!   the target), reset the log, exec the failsafe shell.
//!
//! The supervisor never stays resident: each branch ends in `exec`.

use std::ffi::OsString;
use std::path::Path;

use crate::config::Config;
use crate::crash::{CrashLoopDiagnostics, ThresholdConfig, diagnose};
use crate::crash_log::{CrashEvent, CrashLogStore};
use crate::failsafe::FailsafeReason;
use crate::{Error, unix_now};

/// Set in every process the supervisor launches.
pub const GUARD_ENV: &str = "SUPERVISOR_ACTIVE";

/// Set only inside the failsafe environment.
pub const FAILSAFE_ENV: &str = "SUPERVISOR_FAILSAFE";

/// Why the failsafe environment was entered.
pub const FAILSAFE_REASON_ENV: &str = "SUPERVISOR_FAILSAFE_REASON";

/// Exit status when a passthrough target cannot be exec'd.
pub const EXIT_EXEC_FAILED: i32 = 127;

/// The interpreter command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchRequest {
    #[must_use]
    pub fn new(program: impl Into<OsString>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// What to do with a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchDecision {
    Passthrough,
    Normal,
    Failsafe(FailsafeReason),
}

/// Whether a guard marker value counts as set.
#[must_use]
pub fn guard_active(value: Option<&std::ffi::OsStr>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

/// Decide from the prior launch history (excluding the current launch).
#[must_use]
pub fn decide(
    guard_set: bool,
    prior: &[CrashEvent],
    now: u64,
    cfg: &ThresholdConfig,
) -> (LaunchDecision, Option<CrashLoopDiagnostics>) {
    if guard_set {
        return (LaunchDecision::Passthrough, None);
    }
    let diag = diagnose(prior, now, cfg);
    let decision = if diag.in_crash_loop {
        LaunchDecision::Failsafe(FailsafeReason::CrashLoop)
    } else {
        LaunchDecision::Normal
    };
    (decision, Some(diag))
}

/// Read history, record this launch, and decide.
///
/// Log failures are warnings: an unreadable log counts as empty and a failed
/// append is skipped. A crash loop verdict resets the log.
pub fn record_and_decide(
    store: &CrashLogStore,
    history: usize,
    now: u64,
    cfg: &ThresholdConfig,
) -> LaunchDecision {
    let prior = store.recent(history).unwrap_or_else(|e| {
        tracing::warn!(
            error = %e,
            path = %store.path().display(),
            "Crash log unreadable; treating as empty"
        );
        Vec::new()
    });
    if let Err(e) = store.append(now) {
        tracing::warn!(error = %e, path = %store.path().display(), "Failed to record launch");
    }

    let (decision, diag) = decide(false, &prior, now, cfg);
    if let Some(diag) = diag {
        tracing::debug!(
            history = diag.history_len,
            in_window = diag.in_window,
            threshold = diag.threshold,
            last_launch_at = ?diag.last_launch_at,
            in_crash_loop = diag.in_crash_loop,
            "Crash loop check"
        );
    }

    if decision != LaunchDecision::Normal {
        if let Err(e) = store.reset(now) {
            tracing::warn!(error = %e, "Failed to reset crash log");
        }
    }
    decision
}

/// Run the supervisor for `request`. Returns only when nothing could be
/// exec'd, with the exit status to use.
#[cfg(unix)]
pub fn run(config: &Config, request: &LaunchRequest) -> i32 {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    let crash_log = config.crash_log_path();

    if guard_active(std::env::var_os(GUARD_ENV).as_deref()) {
        tracing::debug!(program = %request.display_program(), "Guard marker set; passing through");
        let err = Error::LaunchFailure {
            program: request.display_program(),
            source: Command::new(&request.program).args(&request.args).exec(),
        };
        eprintln!("supervisor: {err}");
        return EXIT_EXEC_FAILED;
    }

    let store = CrashLogStore::new(&crash_log, config.log.max_bytes);
    let decision = record_and_decide(&store, config.log.history, unix_now(), &config.threshold);

    match decision {
        LaunchDecision::Failsafe(reason) => enter_failsafe(config, &reason, &crash_log),
        LaunchDecision::Normal | LaunchDecision::Passthrough => {
            let source = Command::new(&request.program)
                .args(&request.args)
                .env(GUARD_ENV, "1")
                .exec();
            let reason = FailsafeReason::InterpreterMissing {
                program: request.display_program(),
                error: source.to_string(),
            };
            let err = Error::LaunchFailure {
                program: request.display_program(),
                source,
            };
            tracing::warn!(error = %err, "Interpreter failed to start");
            enter_failsafe(config, &reason, &crash_log)
        }
    }
}

#[cfg(unix)]
fn enter_failsafe(config: &Config, reason: &FailsafeReason, crash_log: &Path) -> i32 {
    crate::failsafe::enter(reason, &config.failsafe, crash_log)
}
