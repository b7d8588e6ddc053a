//! Persisted result of the most recent reconcile pass.
//!
//! A single JSON document at a fixed path, replaced atomically after every
//! pass. External schedulers read `last_check_at` to confirm the keeper is
//! actually running, not merely installed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::replica::{ReplicaHealth, write_file_atomic};

/// RFC 3339 rendering of unix seconds, for the human-readable fields.
fn format_unix(unix_secs: u64) -> String {
    i64::try_from(unix_secs)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map_or_else(|| format!("unix:{unix_secs}"), |dt| dt.to_rfc3339())
}

/// Current on-disk schema version.
pub const KEEPER_STATE_VERSION: u32 = 1;

/// Liveness multiplier: the state is stale once older than this many intervals.
pub const STALE_INTERVALS: u64 = 3;

/// Overall result of a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Every replica already matched; nothing was written.
    Healthy,
    /// At least one replica was rewritten and all are now healthy.
    Repaired,
    /// Some replicas could not be checked or repaired.
    Partial,
    /// No valid source copy exists; nothing was written.
    Unrecoverable,
}

impl ReconcileOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Repaired => "repaired",
            Self::Partial => "partial",
            Self::Unrecoverable => "unrecoverable",
        }
    }

    /// Process exit code for `supervisor-keeper reconcile`.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Healthy | Self::Repaired => 0,
            Self::Partial => 1,
            Self::Unrecoverable => 3,
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one replica path at the last check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub path: PathBuf,
    /// Health observed before any repair.
    pub health: ReplicaHealth,
    /// Whether this pass rewrote the path successfully.
    pub repaired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keeper liveness and integrity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperState {
    pub version: u32,
    /// Unix seconds of the last completed pass.
    pub last_check_at: u64,
    pub last_check_at_human: String,
    /// Hash the replicas were compared against, if one could be determined.
    pub canonical_sha256: Option<String>,
    pub outcome: ReconcileOutcome,
    pub replicas: Vec<ReplicaStatus>,
    /// Process that wrote this record.
    pub pid: u32,
    pub keeper_version: String,
}

impl KeeperState {
    #[must_use]
    pub fn new(
        now: u64,
        canonical_sha256: Option<String>,
        outcome: ReconcileOutcome,
        replicas: Vec<ReplicaStatus>,
    ) -> Self {
        Self {
            version: KEEPER_STATE_VERSION,
            last_check_at: now,
            last_check_at_human: format_unix(now),
            canonical_sha256,
            outcome,
            replicas,
            pid: std::process::id(),
            keeper_version: crate::VERSION.to_string(),
        }
    }

    /// Load the state file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the state file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        write_file_atomic(path, json.as_bytes(), 0o644)
    }

    /// Whether the last pass is older than [`STALE_INTERVALS`] service intervals.
    #[must_use]
    pub fn is_stale(&self, now: u64, interval_secs: u64) -> bool {
        let limit = interval_secs.max(1).saturating_mul(STALE_INTERVALS);
        now.saturating_sub(self.last_check_at) > limit
    }

    /// Number of replicas currently believed healthy.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.health == ReplicaHealth::Healthy || r.repaired)
            .count()
    }
}
