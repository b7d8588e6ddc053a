//! `supervisor-keeper`: integrity monitor for the supervisor's replicas.
//!
//! # Usage
//!
//! ```bash
//! # Seed replicas from a freshly built supervisor and pin its hash
//! supervisor-keeper install --source target/release/supervisor
//!
//! # One integrity pass (exit 0 healthy/repaired, 1 partial, 3 unrecoverable)
//! supervisor-keeper reconcile
//!
//! # Keep it running under systemd/launchd
//! supervisor-keeper install-service
//!
//! # Route new interactive shells through the supervisor
//! supervisor-keeper install-hook --shell zsh
//! ```

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use guardian_core::config::{Config, resolve_config_path};
use guardian_core::keeper::{self, ReconcileReport};
use guardian_core::keeper_state::{KeeperState, ReconcileOutcome};
use guardian_core::logging::{LogConfig, init_logging};
use guardian_core::replica::ReplicaManifest;
use guardian_core::setup::{self, ShellType};
use guardian_core::{lock, service, unix_now};
use serde_json::json;

/// Exit status for configuration and usage problems.
const EXIT_CONFIG: u8 = 2;

/// Keep redundant copies of the supervisor binary intact.
#[derive(Parser, Debug)]
#[command(name = "supervisor-keeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/guardian/guardian.toml).
    #[arg(long, global = true, env = "GUARDIAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one integrity pass now.
    Reconcile,

    /// Seed the replica set from a supervisor binary and write the manifest.
    Install {
        /// Binary to replicate (default: the `supervisor` next to this program).
        #[arg(long)]
        source: Option<PathBuf>,

        /// Replica paths (default: `keeper.replicas` from the config).
        paths: Vec<PathBuf>,
    },

    /// Reconcile on a fixed interval until SIGINT/SIGTERM.
    Service,

    /// Register `supervisor-keeper service` with systemd (Linux) or launchd (macOS).
    InstallService,

    /// Remove the service registration.
    UninstallService,

    /// Show the last reconcile result and service liveness.
    Status {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Add the supervisor hook to the top of a shell rc file.
    InstallHook {
        /// Shell to hook (default: detected from $SHELL).
        #[arg(long, value_enum)]
        shell: Option<HookShell>,

        /// Rc file to patch (default: ~/.bashrc or ~/.zshrc).
        #[arg(long)]
        rc: Option<PathBuf>,

        /// Supervisor path the hook execs (default: first replica).
        #[arg(long)]
        supervisor: Option<PathBuf>,
    },

    /// Remove the supervisor hook from a shell rc file.
    RemoveHook {
        #[arg(long, value_enum)]
        shell: Option<HookShell>,

        #[arg(long)]
        rc: Option<PathBuf>,
    },

    /// Unregister the service and delete every replica, the manifest, and the hooks.
    Uninstall,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HookShell {
    Bash,
    Zsh,
}

impl From<HookShell> for ShellType {
    fn from(shell: HookShell) -> Self {
        match shell {
            HookShell::Bash => Self::Bash,
            HookShell::Zsh => Self::Zsh,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&LogConfig::keeper());

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("supervisor-keeper: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("supervisor-keeper: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(dispatch(cli.command, &config, cli.config.as_deref()));
    // Probes stuck on a dead mount must not hold the process open
    runtime.shutdown_timeout(Duration::from_millis(250));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("supervisor-keeper: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn dispatch(command: Command, config: &Config, explicit_config: Option<&Path>) -> Result<u8> {
    match command {
        Command::Reconcile => {
            let report = keeper::run_reconcile(config)
                .await
                .context("reconcile failed (has `supervisor-keeper install` been run?)")?;
            print_report(&report);
            Ok(exit_code(report.outcome))
        }
        Command::Install { source, paths } => {
            let source = match source {
                Some(path) => path,
                None => sibling_supervisor()?,
            };
            let (manifest, report) = keeper::install(config, &source, paths)
                .await
                .with_context(|| format!("installing from {}", source.display()))?;
            println!(
                "Pinned {} across {} replica(s)",
                manifest.canonical_sha256.as_deref().unwrap_or("-"),
                manifest.paths.len()
            );
            print_report(&report);
            Ok(exit_code(report.outcome))
        }
        Command::Service => {
            keeper::run_service(config, async {
                if let Err(e) = keeper::wait_for_shutdown_signal().await {
                    tracing::error!(error = %e, "Signal handling unavailable; stopping");
                }
            })
            .await?;
            Ok(0)
        }
        Command::InstallService => {
            let keeper_binary = std::env::current_exe()
                .and_then(|p| p.canonicalize())
                .context("locating supervisor-keeper binary")?;
            let spec = service::ServiceSpec {
                keeper_binary,
                config_path: explicit_config.map(Path::to_path_buf),
            };
            Ok(report_service(&service::install(&spec)))
        }
        Command::UninstallService => Ok(report_service(&service::uninstall())),
        Command::Status { json } => {
            print_status(config, json)?;
            Ok(0)
        }
        Command::InstallHook {
            shell,
            rc,
            supervisor,
        } => {
            let shell = resolve_shell(shell)?;
            let rc = match rc {
                Some(rc) => rc,
                None => setup::locate_shell_rc(shell)?,
            };
            let supervisor = supervisor.unwrap_or_else(|| default_hook_target(config));
            let interpreter = interpreter_path(shell);
            let result = setup::patch_shell_rc_at(&rc, &supervisor, &interpreter)?;
            println!("{}", result.message);
            Ok(0)
        }
        Command::RemoveHook { shell, rc } => {
            let rc = match rc {
                Some(rc) => rc,
                None => setup::locate_shell_rc(resolve_shell(shell)?)?,
            };
            let result = setup::unpatch_shell_rc_at(&rc)?;
            println!("{}", result.message);
            Ok(0)
        }
        Command::Uninstall => {
            let svc = service::uninstall();
            println!("{}", svc.message);
            for shell in [ShellType::Bash, ShellType::Zsh] {
                if let Ok(rc) = setup::locate_shell_rc(shell) {
                    match setup::unpatch_shell_rc_at(&rc) {
                        Ok(result) if result.modified => println!("{}", result.message),
                        Ok(_) => {}
                        Err(e) => eprintln!("supervisor-keeper: {e}"),
                    }
                }
            }
            for path in keeper::uninstall(config)? {
                println!("Removed {}", path.display());
            }
            Ok(if svc.success { 0 } else { 1 })
        }
    }
}

const fn exit_code(outcome: ReconcileOutcome) -> u8 {
    // Outcome codes are 0, 1, or 3
    outcome.exit_code() as u8
}

fn print_report(report: &ReconcileReport) {
    println!("outcome: {}", report.outcome);
    for replica in &report.replicas {
        let action = if replica.repaired { " -> restored" } else { "" };
        match &replica.error {
            Some(err) => println!("  {} {}{action} ({err})", replica.health, replica.path.display()),
            None => println!("  {} {}{action}", replica.health, replica.path.display()),
        }
    }
    if report.outcome == ReconcileOutcome::Unrecoverable {
        eprintln!(
            "supervisor-keeper: no valid supervisor copy remains; reinstall with `supervisor-keeper install --source <binary>`"
        );
    }
}

fn report_service(result: &service::ServiceResult) -> u8 {
    if result.success {
        println!("{}", result.message);
        0
    } else {
        eprintln!("supervisor-keeper: {}", result.message);
        1
    }
}

/// The `supervisor` binary installed alongside this one.
fn sibling_supervisor() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating supervisor-keeper binary")?;
    let candidate = exe.with_file_name("supervisor");
    if !candidate.is_file() {
        bail!(
            "no supervisor binary next to {}; pass --source",
            exe.display()
        );
    }
    Ok(candidate)
}

fn resolve_shell(shell: Option<HookShell>) -> Result<ShellType> {
    if let Some(shell) = shell {
        return Ok(shell.into());
    }
    match ShellType::detect() {
        Some(ShellType::Sh) | None => bail!("could not detect a bash or zsh login shell; pass --shell"),
        Some(shell) => Ok(shell),
    }
}

/// Interpreter the hook hands to the supervisor: `$SHELL` when it is the
/// same kind of shell, else `/bin/<name>`.
fn interpreter_path(shell: ShellType) -> PathBuf {
    std::env::var("SHELL")
        .ok()
        .filter(|s| ShellType::from_path(s) == Some(shell))
        .map_or_else(|| PathBuf::from("/bin").join(shell.name()), PathBuf::from)
}

/// First replica in the manifest, else the first configured replica.
fn default_hook_target(config: &Config) -> PathBuf {
    ReplicaManifest::load(&config.manifest_path())
        .ok()
        .and_then(|m| m.paths.into_iter().next())
        .or_else(|| config.keeper.replicas.first().cloned())
        .unwrap_or_else(|| PathBuf::from("supervisor"))
}

fn print_status(config: &Config, as_json: bool) -> Result<()> {
    let state = KeeperState::load(&config.keeper_state_path())
        .with_context(|| format!("reading {}", config.keeper_state_path().display()))?;
    let now = unix_now();
    let stale = state
        .as_ref()
        .is_none_or(|s| s.is_stale(now, config.keeper.interval_secs));
    let svc = service::status();
    let holder = lock::service_holder(&config.keeper_lock_path());

    if as_json {
        let doc = json!({
            "state": state,
            "stale": stale,
            "service": svc.to_string(),
            "service_pid": holder,
            "manifest": config.manifest_path(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("manifest: {}", config.manifest_path().display());
    println!("service:  {svc}");
    if let Some(pid) = holder {
        println!("loop:     pid {pid}");
    }
    match state {
        None => println!("last check: never"),
        Some(state) => {
            let age = now.saturating_sub(state.last_check_at);
            println!(
                "last check: {} ({age}s ago){}",
                state.last_check_at_human,
                if stale { " STALE" } else { "" }
            );
            println!(
                "outcome:  {} ({}/{} healthy)",
                state.outcome,
                state.healthy_count(),
                state.replicas.len()
            );
            for replica in &state.replicas {
                println!("  {} {}", replica.health, replica.path.display());
            }
        }
    }
    Ok(())
}
