//! Replica set: redundant copies of the supervisor binary.
//!
//! A [`ReplicaManifest`] names the paths the keeper is responsible for and,
//! normally, the canonical SHA-256 of the binary they must hold. Individual
//! paths are inspected with [`inspect_replica`] and repaired with
//! [`write_replica_atomic`], which never exposes a partially written file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Mode given to every replica.
const REPLICA_MODE: u32 = 0o755;

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The supervisor executable, identified by its content hash.
#[derive(Clone, PartialEq, Eq)]
pub struct GuardianBinary {
    bytes: Vec<u8>,
    sha256: String,
}

impl std::fmt::Debug for GuardianBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianBinary")
            .field("len", &self.bytes.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

impl GuardianBinary {
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        Self { bytes, sha256 }
    }

    /// Read a binary from disk.
    pub fn read(path: &Path) -> Result<Self> {
        Ok(Self::from_bytes(fs::read(path)?))
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

/// The set of paths the keeper maintains (`replicas.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaManifest {
    /// Hash every replica must match. When absent the keeper falls back to
    /// consensus among the replicas themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_sha256: Option<String>,
    /// Replica locations, in priority order.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl ReplicaManifest {
    #[must_use]
    pub fn new(canonical_sha256: Option<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            canonical_sha256,
            paths,
        }
    }

    /// Parse and validate manifest text. `origin` is used in error messages.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self> {
        let manifest: Self = toml::from_str(text).map_err(|e| Error::Manifest {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        let fail = |message: String| Error::Manifest {
            path: origin.to_path_buf(),
            message,
        };
        if self.paths.is_empty() {
            return Err(fail("no replica paths listed".to_string()));
        }
        if let Some(bad) = self.paths.iter().find(|p| !p.is_absolute()) {
            return Err(fail(format!("replica path is not absolute: {}", bad.display())));
        }
        if let Some(hash) = &self.canonical_sha256 {
            if !is_sha256_hex(hash) {
                return Err(fail(format!("canonical_sha256 is not a sha256 hex digest: {hash}")));
            }
        }
        Ok(())
    }

    /// Load a manifest from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&text, path)
    }

    /// Write the manifest atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate(path)?;
        let text = toml::to_string_pretty(self).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        write_file_atomic(path, text.as_bytes(), 0o644)
    }
}

/// Observed state of one replica path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaHealth {
    Healthy,
    Missing,
    Mismatched,
    NotExecutable,
    Unreachable,
}

impl ReplicaHealth {
    /// Whether the keeper should rewrite this path.
    #[must_use]
    pub const fn needs_repair(self) -> bool {
        matches!(self, Self::Missing | Self::Mismatched | Self::NotExecutable)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Missing => "missing",
            Self::Mismatched => "mismatched",
            Self::NotExecutable => "not_executable",
            Self::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for ReplicaHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw observation of a replica path, before comparison with a canonical hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaProbe {
    Missing,
    Present { sha256: String, executable: bool },
    Unreachable(String),
}

impl ReplicaProbe {
    /// Classify against the canonical hash.
    #[must_use]
    pub fn health(&self, canonical: &str) -> ReplicaHealth {
        match self {
            Self::Missing => ReplicaHealth::Missing,
            Self::Unreachable(_) => ReplicaHealth::Unreachable,
            Self::Present { sha256, .. } if sha256 != canonical => ReplicaHealth::Mismatched,
            Self::Present {
                executable: false, ..
            } => ReplicaHealth::NotExecutable,
            Self::Present { .. } => ReplicaHealth::Healthy,
        }
    }

    #[must_use]
    pub fn sha256(&self) -> Option<&str> {
        match self {
            Self::Present { sha256, .. } => Some(sha256),
            _ => None,
        }
    }
}

/// Stat and hash one replica path. Never fails; errors become probes.
#[must_use]
pub fn probe_replica(path: &Path) -> ReplicaProbe {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReplicaProbe::Missing,
        Err(e) => return ReplicaProbe::Unreachable(e.to_string()),
    };
    if !meta.is_file() {
        // A directory or socket squatting on the path is content that differs
        return ReplicaProbe::Present {
            sha256: String::new(),
            executable: false,
        };
    }
    match fs::read(path) {
        Ok(bytes) => ReplicaProbe::Present {
            sha256: sha256_hex(&bytes),
            executable: is_executable(&meta),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => ReplicaProbe::Missing,
        Err(e) => ReplicaProbe::Unreachable(e.to_string()),
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    true
}

/// Pick the source of truth among probed replicas when no canonical hash is
/// pinned: the hash held by the most replicas, ties going to the earliest
/// listed.
#[must_use]
pub fn consensus_hash(probes: &[ReplicaProbe]) -> Option<String> {
    let mut tallies: Vec<(&str, usize)> = Vec::new();
    for hash in probes.iter().filter_map(ReplicaProbe::sha256) {
        if hash.is_empty() {
            continue;
        }
        match tallies.iter_mut().find(|(h, _)| *h == hash) {
            Some((_, count)) => *count += 1,
            None => tallies.push((hash, 1)),
        }
    }
    // Stable max: first listed wins a tie
    let mut best: Option<(&str, usize)> = None;
    for (hash, count) in tallies {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((hash, count));
        }
    }
    best.map(|(hash, _)| hash.to_string())
}

/// Unique hidden temp path next to `target`.
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "replica".into(), |n| n.to_string_lossy());
    let file = format!(
        ".{name}.tmp.{}.{:08x}",
        std::process::id(),
        rand::random::<u32>()
    );
    target.with_file_name(file)
}

fn open_temp(path: &Path, mode: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Write a small file atomically: temp file in the same directory, fsync,
/// rename.
pub(crate) fn write_file_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path_for(path);
    let result = (|| -> io::Result<()> {
        let mut file = open_temp(&tmp, mode)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Restore one replica from `source`.
///
/// Writes to a hidden temp file beside `target`, fsyncs, sets mode 0755,
/// re-reads and re-hashes the temp file, then renames it over `target`.
/// A failed rename is retried once after `rename_backoff`. The temp file is
/// removed on every failure path, so `target` is either untouched or fully
/// replaced.
pub fn write_replica_atomic(
    target: &Path,
    source: &GuardianBinary,
    rename_backoff: Duration,
) -> Result<()> {
    let repair_err = |message: String| Error::ReplicaRepair {
        path: target.to_path_buf(),
        message,
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| repair_err(format!("create {}: {e}", parent.display())))?;
    }

    let tmp = temp_path_for(target);
    let result = stage_and_rename(&tmp, target, source, rename_backoff);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(repair_err)
}

fn stage_and_rename(
    tmp: &Path,
    target: &Path,
    source: &GuardianBinary,
    rename_backoff: Duration,
) -> std::result::Result<(), String> {
    {
        let mut file = open_temp(tmp, REPLICA_MODE).map_err(|e| format!("create temp: {e}"))?;
        file.write_all(source.bytes())
            .map_err(|e| format!("write temp: {e}"))?;
        file.sync_all().map_err(|e| format!("fsync temp: {e}"))?;
    }
    set_mode(tmp, REPLICA_MODE).map_err(|e| format!("chmod temp: {e}"))?;

    let written = fs::read(tmp).map_err(|e| format!("verify read: {e}"))?;
    let written_hash = sha256_hex(&written);
    if written_hash != source.sha256() {
        return Err(format!(
            "verification failed: wrote {written_hash}, expected {}",
            source.sha256()
        ));
    }

    match fs::rename(tmp, target) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(
                target = %target.display(),
                error = %first,
                backoff_ms = rename_backoff.as_millis() as u64,
                "Replica rename failed; retrying once"
            );
            std::thread::sleep(rename_backoff);
            fs::rename(tmp, target).map_err(|e| format!("rename: {e} (first attempt: {first})"))
        }
    }
}
