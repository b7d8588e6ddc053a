//! Integrity monitor ("keeper").
//!
//! [`reconcile`] is a single bounded pass over the replica set: probe every
//! path under a deadline, choose a source of truth, rewrite whatever is
//! missing or wrong, and report. Filesystem work runs on the blocking pool so
//! a stuck mount costs one worker thread, never the pass.
//!
//! [`run_service`] repeats the pass on a fixed interval until shutdown.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};

use crate::config::{Config, KeeperConfig};
use crate::keeper_state::{KeeperState, ReconcileOutcome, ReplicaStatus};
use crate::lock::ServiceLock;
use crate::replica::{
    GuardianBinary, ReplicaHealth, ReplicaManifest, ReplicaProbe, consensus_hash, probe_replica,
    write_replica_atomic,
};
use crate::{Error, Result, unix_now};

/// Timing knobs for one pass.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Deadline for probing or reading a single replica.
    pub check_timeout: Duration,
    /// Delay before the single rename retry.
    pub rename_backoff: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::from(&KeeperConfig::default())
    }
}

impl From<&KeeperConfig> for ReconcileOptions {
    fn from(cfg: &KeeperConfig) -> Self {
        Self {
            check_timeout: Duration::from_millis(cfg.check_timeout_ms.max(1)),
            rename_backoff: Duration::from_millis(cfg.rename_retry_backoff_ms),
        }
    }
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub canonical_sha256: Option<String>,
    pub replicas: Vec<ReplicaStatus>,
    /// Number of replica files replaced.
    pub writes: usize,
}

impl ReconcileReport {
    /// Snapshot for persistence.
    #[must_use]
    pub fn to_state(&self, now: u64) -> KeeperState {
        KeeperState::new(
            now,
            self.canonical_sha256.clone(),
            self.outcome,
            self.replicas.clone(),
        )
    }

    /// Turn an unrecoverable pass into an error.
    pub fn into_result(self) -> Result<Self> {
        if self.outcome == ReconcileOutcome::Unrecoverable {
            return Err(Error::Unrecoverable {
                checked: self.replicas.len(),
            });
        }
        Ok(self)
    }
}

/// Probe one path on the blocking pool, bounded by `deadline`.
async fn probe_with_deadline(path: PathBuf, deadline: Instant) -> ReplicaProbe {
    let handle = spawn_blocking(move || probe_replica(&path));
    match timeout_at(deadline, handle).await {
        Ok(Ok(probe)) => probe,
        Ok(Err(join)) => ReplicaProbe::Unreachable(format!("probe task failed: {join}")),
        Err(_) => ReplicaProbe::Unreachable("check timed out".to_string()),
    }
}

/// Read a candidate source and confirm it still hashes to `canonical`.
async fn load_source(path: &Path, canonical: &str, limit: Duration) -> Option<GuardianBinary> {
    let owned = path.to_path_buf();
    let read = timeout(limit, spawn_blocking(move || GuardianBinary::read(&owned))).await;
    match read {
        Ok(Ok(Ok(binary))) if binary.sha256() == canonical => Some(binary),
        Ok(Ok(Ok(_))) => {
            tracing::warn!(path = %path.display(), "Source replica changed while reading");
            None
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read source replica");
            None
        }
        Ok(Err(join)) => {
            tracing::warn!(path = %path.display(), error = %join, "Source read task failed");
            None
        }
        Err(_) => {
            tracing::warn!(path = %path.display(), "Source read timed out");
            None
        }
    }
}

/// Run one integrity pass against `manifest`.
pub async fn reconcile(manifest: &ReplicaManifest, opts: &ReconcileOptions) -> ReconcileReport {
    reconcile_with_seed(manifest, None, opts).await
}

/// Run one integrity pass, optionally supplying an out-of-set source.
///
/// `seed` is used by `install`, when no replica exists yet. It is only
/// accepted if it matches the manifest's canonical hash (or there is none).
pub async fn reconcile_with_seed(
    manifest: &ReplicaManifest,
    seed: Option<GuardianBinary>,
    opts: &ReconcileOptions,
) -> ReconcileReport {
    let deadline = Instant::now() + opts.check_timeout;
    let mut probes = Vec::with_capacity(manifest.paths.len());
    let handles: Vec<_> = manifest
        .paths
        .iter()
        .cloned()
        .map(|path| tokio::spawn(probe_with_deadline(path, deadline)))
        .collect();
    for handle in handles {
        probes.push(
            handle
                .await
                .unwrap_or_else(|e| ReplicaProbe::Unreachable(format!("probe task failed: {e}"))),
        );
    }

    let canonical = manifest
        .canonical_sha256
        .clone()
        .or_else(|| consensus_hash(&probes))
        .or_else(|| seed.as_ref().map(|s| s.sha256().to_string()));

    let any_unreachable = probes
        .iter()
        .any(|p| matches!(p, ReplicaProbe::Unreachable(_)));

    let Some(canonical) = canonical else {
        if any_unreachable {
            // An uninspected copy may still be intact
            return blocked(manifest, &probes, None);
        }
        return unrecoverable(manifest, &probes, None);
    };

    let health: Vec<ReplicaHealth> = probes.iter().map(|p| p.health(&canonical)).collect();

    let mut source = seed.filter(|s| s.sha256() == canonical);
    if source.is_none() && health.iter().any(|h| h.needs_repair()) {
        for (path, probe) in manifest.paths.iter().zip(&probes) {
            if probe.sha256() != Some(canonical.as_str()) {
                continue;
            }
            if let Some(binary) = load_source(path, &canonical, opts.check_timeout).await {
                tracing::debug!(source = %path.display(), "Selected source replica");
                source = Some(binary);
                break;
            }
        }
        if source.is_none() {
            if any_unreachable {
                return blocked(manifest, &probes, Some(canonical));
            }
            return unrecoverable(manifest, &probes, Some(canonical));
        }
    }
    let mut replicas = Vec::with_capacity(probes.len());
    let mut writes = 0;
    let mut failures = 0;
    for ((path, probe), health) in manifest.paths.iter().zip(&probes).zip(health) {
        let mut status = ReplicaStatus {
            path: path.clone(),
            health,
            repaired: false,
            error: None,
        };
        match (health, &source) {
            (ReplicaHealth::Unreachable, _) => {
                if let ReplicaProbe::Unreachable(reason) = probe {
                    status.error = Some(reason.clone());
                }
                tracing::warn!(path = %path.display(), error = ?status.error, "Replica unreachable; skipped");
                failures += 1;
            }
            (h, Some(binary)) if h.needs_repair() => {
                match repair(path, binary.clone(), opts).await {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), was = %h, "Replica restored");
                        status.repaired = true;
                        writes += 1;
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "Replica repair failed");
                        status.error = Some(e.to_string());
                        failures += 1;
                    }
                }
            }
            _ => {}
        }
        replicas.push(status);
    }

    let outcome = if failures > 0 {
        ReconcileOutcome::Partial
    } else if writes > 0 {
        ReconcileOutcome::Repaired
    } else {
        ReconcileOutcome::Healthy
    };

    ReconcileReport {
        outcome,
        canonical_sha256: Some(canonical),
        replicas,
        writes,
    }
}

async fn repair(path: &Path, binary: GuardianBinary, opts: &ReconcileOptions) -> Result<()> {
    let target = path.to_path_buf();
    let backoff = opts.rename_backoff;
    let limit = opts.check_timeout + backoff;
    let task = spawn_blocking(move || write_replica_atomic(&target, &binary, backoff));
    match timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::ReplicaRepair {
            path: path.to_path_buf(),
            message: format!("repair task failed: {join}"),
        }),
        Err(_) => Err(Error::ReplicaRepair {
            path: path.to_path_buf(),
            message: "repair timed out".to_string(),
        }),
    }
}

/// Per-path status for a pass that wrote nothing.
fn untouched_statuses(
    manifest: &ReplicaManifest,
    probes: &[ReplicaProbe],
    canonical: Option<&str>,
) -> Vec<ReplicaStatus> {
    manifest
        .paths
        .iter()
        .zip(probes)
        .map(|(path, probe)| {
            let (health, error) = match (probe, canonical) {
                (ReplicaProbe::Unreachable(reason), _) => {
                    tracing::warn!(path = %path.display(), error = %reason, "Replica unreachable; skipped");
                    (ReplicaHealth::Unreachable, Some(reason.clone()))
                }
                (ReplicaProbe::Missing, _) => (ReplicaHealth::Missing, None),
                (p, Some(hash)) => (p.health(hash), None),
                (ReplicaProbe::Present { .. }, None) => (ReplicaHealth::Mismatched, None),
            };
            ReplicaStatus {
                path: path.clone(),
                health,
                repaired: false,
                error,
            }
        })
        .collect()
}

/// No reachable source, but an unreachable replica may still hold one.
fn blocked(
    manifest: &ReplicaManifest,
    probes: &[ReplicaProbe],
    canonical: Option<String>,
) -> ReconcileReport {
    tracing::warn!(
        checked = probes.len(),
        "No reachable source replica; retrying on the next pass"
    );
    ReconcileReport {
        outcome: ReconcileOutcome::Partial,
        replicas: untouched_statuses(manifest, probes, canonical.as_deref()),
        canonical_sha256: canonical,
        writes: 0,
    }
}

fn unrecoverable(
    manifest: &ReplicaManifest,
    probes: &[ReplicaProbe],
    canonical: Option<String>,
) -> ReconcileReport {
    tracing::error!(
        checked = probes.len(),
        "No valid supervisor replica remains; manual reinstall required"
    );
    ReconcileReport {
        outcome: ReconcileOutcome::Unrecoverable,
        replicas: untouched_statuses(manifest, probes, canonical.as_deref()),
        canonical_sha256: canonical,
        writes: 0,
    }
}

fn log_report(report: &ReconcileReport) {
    match report.outcome {
        ReconcileOutcome::Healthy => tracing::debug!(
            replicas = report.replicas.len(),
            "All replicas healthy"
        ),
        ReconcileOutcome::Repaired => tracing::info!(
            replicas = report.replicas.len(),
            writes = report.writes,
            "Replica set repaired"
        ),
        ReconcileOutcome::Partial => tracing::warn!(
            replicas = report.replicas.len(),
            writes = report.writes,
            "Replica set partially repaired"
        ),
        ReconcileOutcome::Unrecoverable => tracing::error!(
            replicas = report.replicas.len(),
            "Replica set unrecoverable"
        ),
    }
}

/// Load the manifest named by `config`, reconcile, and persist KeeperState.
///
/// The state file is written for every outcome, unrecoverable included.
pub async fn run_reconcile(config: &Config) -> Result<ReconcileReport> {
    let manifest = ReplicaManifest::load(&config.manifest_path())?;
    let report = reconcile(&manifest, &ReconcileOptions::from(&config.keeper)).await;
    persist(config, &report)?;
    Ok(report)
}

fn persist(config: &Config, report: &ReconcileReport) -> Result<()> {
    log_report(report);
    report.to_state(unix_now()).save(&config.keeper_state_path())
}

/// Seed the replica set from `source` and write the manifest.
///
/// `paths` defaults to `config.keeper.replicas` when empty. The manifest is
/// pinned to the source's hash, so later passes never drift to a corrupted
/// majority.
pub async fn install(
    config: &Config,
    source: &Path,
    paths: Vec<PathBuf>,
) -> Result<(ReplicaManifest, ReconcileReport)> {
    let owned = source.to_path_buf();
    let binary = spawn_blocking(move || GuardianBinary::read(&owned))
        .await
        .map_err(|e| Error::SetupError(format!("reading {}: {e}", source.display())))??;

    let paths = if paths.is_empty() {
        config.keeper.replicas.clone()
    } else {
        paths
    };
    let manifest = ReplicaManifest::new(Some(binary.sha256().to_string()), paths);
    let manifest_path = config.manifest_path();
    manifest.save(&manifest_path)?;
    tracing::info!(
        manifest = %manifest_path.display(),
        sha256 = binary.sha256(),
        replicas = manifest.paths.len(),
        "Wrote replica manifest"
    );

    let report =
        reconcile_with_seed(&manifest, Some(binary), &ReconcileOptions::from(&config.keeper))
            .await;
    persist(config, &report)?;
    Ok((manifest, report))
}

/// Remove every replica, the manifest, and the keeper state.
///
/// Returns the paths that were deleted.
pub fn uninstall(config: &Config) -> Result<Vec<PathBuf>> {
    let manifest_path = config.manifest_path();
    let mut targets = match ReplicaManifest::load(&manifest_path) {
        Ok(manifest) => manifest.paths,
        Err(e) => {
            tracing::warn!(error = %e, "Manifest unreadable; removing configured defaults");
            config.keeper.replicas.clone()
        }
    };
    targets.push(manifest_path);
    targets.push(config.keeper_state_path());

    let mut removed = Vec::new();
    for path in targets {
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Resolve once the process receives SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Service(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Service(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}

/// Long-running service: reconcile every `keeper.interval_secs` until
/// `shutdown` resolves.
///
/// Holds the single-instance lock for its lifetime. A slow pass makes the
/// loop skip ticks rather than queue them. Per-pass errors (for example an
/// unreadable manifest) are logged and the loop carries on.
pub async fn run_service<F>(config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let lock_path = config.keeper_lock_path();
    let _lock = ServiceLock::acquire(&lock_path)?;

    let period = Duration::from_secs(config.keeper.interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = period.as_secs(),
        manifest = %config.manifest_path().display(),
        "Keeper service started"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("Keeper service stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = run_reconcile(config).await {
                    tracing::error!(error = %e, "Reconcile pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::sha256_hex;
    use std::fs;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_exec(path: &Path, bytes: &[u8]) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn opts() -> ReconcileOptions {
        ReconcileOptions {
            check_timeout: Duration::from_secs(5),
            rename_backoff: Duration::from_millis(1),
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.state_dir = Some(dir.path().join("state"));
        config.paths.manifest = Some(dir.path().join("replicas.toml"));
        config.keeper.replicas = vec![dir.path().join("r1"), dir.path().join("r2")];
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn not_executable_is_repaired() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_exec(&a, b"bin");
        fs::write(&b, b"bin").unwrap();
        let manifest = ReplicaManifest::new(Some(sha256_hex(b"bin")), vec![a, b.clone()]);

        let report = reconcile(&manifest, &opts()).await;
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.replicas[1].health, ReplicaHealth::NotExecutable);
        assert!(report.replicas[1].repaired);
        assert_eq!(report.writes, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn consensus_used_without_pinned_hash() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("r{i}"))).collect();
        write_exec(&paths[0], b"corrupt");
        write_exec(&paths[1], b"good");
        write_exec(&paths[2], b"good");
        let manifest = ReplicaManifest::new(None, paths.clone());

        let report = reconcile(&manifest, &opts()).await;
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.canonical_sha256, Some(sha256_hex(b"good")));
        assert_eq!(fs::read(&paths[0]).unwrap(), b"good");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreachable_survivor_is_partial_not_unrecoverable() {
        let dir = TempDir::new().unwrap();
        // A regular file where a directory should be makes the path uninspectable
        let blocker = dir.path().join("mount");
        fs::write(&blocker, b"").unwrap();
        let missing = dir.path().join("gone").join("supervisor");
        let manifest = ReplicaManifest::new(
            Some(sha256_hex(b"bin")),
            vec![
                missing.clone(),
                blocker.join("a").join("supervisor"),
                blocker.join("b").join("supervisor"),
            ],
        );

        let report = reconcile(&manifest, &opts()).await;
        assert_eq!(report.outcome, ReconcileOutcome::Partial);
        assert_eq!(report.writes, 0);
        assert_eq!(report.replicas[0].health, ReplicaHealth::Missing);
        assert_eq!(report.replicas[1].health, ReplicaHealth::Unreachable);
        assert!(report.replicas[1].error.is_some());
        assert!(!missing.exists());
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn into_result_flags_unrecoverable() {
        let dir = TempDir::new().unwrap();
        let manifest = ReplicaManifest::new(None, vec![dir.path().join("gone")]);
        let report = reconcile(&manifest, &opts()).await;
        assert_eq!(report.outcome, ReconcileOutcome::Unrecoverable);
        let err = report.into_result().unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_seeds_replicas_and_writes_state() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let source = dir.path().join("build").join("supervisor");
        write_exec(&source, b"supervisor-binary");

        let (manifest, report) = install(&config, &source, Vec::new()).await.unwrap();
        assert_eq!(manifest.paths, config.keeper.replicas);
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.writes, 2);
        for path in &manifest.paths {
            assert_eq!(fs::read(path).unwrap(), b"supervisor-binary");
        }

        let state = KeeperState::load(&config.keeper_state_path())
            .unwrap()
            .unwrap();
        assert_eq!(state.outcome, ReconcileOutcome::Repaired);
        assert_eq!(ReplicaManifest::load(&config.manifest_path()).unwrap(), manifest);

        // Second pass through the persisted manifest is a no-op
        let again = run_reconcile(&config).await.unwrap();
        assert_eq!(again.outcome, ReconcileOutcome::Healthy);
        assert_eq!(again.writes, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninstall_removes_everything() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let source = dir.path().join("supervisor");
        write_exec(&source, b"bin");
        install(&config, &source, Vec::new()).await.unwrap();

        let removed = uninstall(&config).unwrap();
        assert_eq!(removed.len(), 4);
        assert!(!config.manifest_path().exists());
        for path in &config.keeper.replicas {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn run_reconcile_without_manifest_is_error() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let err = run_reconcile(&config).await.unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[tokio::test]
    async fn service_stops_on_shutdown_and_holds_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let lock_path = config.keeper_lock_path();

        let service = {
            let config = config.clone();
            tokio::spawn(async move {
                run_service(&config, async {
                    let _ = rx.await;
                })
                .await
            })
        };
        // The holder pid is written once the lock is taken
        for _ in 0..200 {
            if fs::read_to_string(&lock_path).is_ok_and(|s| !s.trim().is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            crate::lock::service_holder(&lock_path),
            Some(std::process::id())
        );
        assert!(run_service(&config, std::future::pending()).await.is_err());

        tx.send(()).unwrap();
        service.await.unwrap().unwrap();
        assert_eq!(crate::lock::service_holder(&lock_path), None);
    }
}
