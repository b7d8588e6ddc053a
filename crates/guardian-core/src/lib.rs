//! guardian-core: Core library for Shell Guardian
//!
//! Keeps an interactive terminal usable when its shell configuration breaks.
//! The supervisor sits in front of the real interpreter and diverts into a
//! bare failsafe shell when launches pile up too fast; the keeper keeps
//! redundant copies of the supervisor binary intact.
//!
//! # Architecture
//!
//! ```text
//! shell rc hook → supervisor → CrashLogStore → crash detector
//!                     ↓                              ↓
//!              exec interpreter            exec failsafe shell
//!
//! systemd/launchd → supervisor-keeper → reconcile(ReplicaSet) → KeeperState
//! ```
//!
//! # Modules
//!
//! - `crash_log`: Append-only launch log with reset markers and rotation
//! - `crash`: Crash loop detection (pure)
//! - `supervisor`: Launch state machine (passthrough / normal / failsafe)
//! - `failsafe`: Minimal recovery shell environment
//! - `replica`: Replica manifest, hashing, atomic replica writes
//! - `keeper`: Reconcile pass, install, service loop
//! - `keeper_state`: Persisted result of the last reconcile
//! - `lock`: Single-instance lock for the keeper service
//! - `service`: systemd/launchd registration
//! - `setup`: Shell rc hook installation
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod crash;
pub mod crash_log;
pub mod error;
pub mod failsafe;
pub mod keeper;
pub mod keeper_state;
pub mod lock;
pub mod logging;
pub mod replica;
pub mod service;
pub mod setup;
pub mod supervisor;

pub use error::{Error, Result};

/// Version of the guardian-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in unix seconds (0 if the clock predates 1970).
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
