//! Crash loop detection.
//!
//! Rapid repeated launches of the interactive interpreter are treated as a
//! proxy for "the interpreter is crashing". The decision is a pure function
//! of the prior launch history, the current time, and a [`ThresholdConfig`].

use serde::{Deserialize, Serialize};

use crate::crash_log::CrashEvent;

/// Smallest accepted `max_events`; a threshold of 1 would divert every launch.
pub const MIN_MAX_EVENTS: u32 = 2;

/// Crash loop thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Number of launches within the window that constitutes a loop (default: 3).
    pub max_events: u32,
    /// Lookback window in seconds (default: 10).
    pub window_seconds: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_events: 3,
            window_seconds: 10,
        }
    }
}

impl ThresholdConfig {
    /// Clamp values into the supported range.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            max_events: self.max_events.max(MIN_MAX_EVENTS),
            window_seconds: self.window_seconds.max(1),
        }
    }

    /// Number of prior launches within the window that trips the detector.
    #[must_use]
    pub fn prior_threshold(&self) -> u32 {
        self.max_events.saturating_sub(1).max(1)
    }
}

/// Whether `ts` falls inside the window ending at `now`.
///
/// Timestamps from the future (clock skew) count as recent.
fn within_window(ts: u64, now: u64, window_seconds: u64) -> bool {
    ts >= now || now - ts < window_seconds
}

/// Count prior launches inside the window ending at `now`.
#[must_use]
pub fn launches_in_window(log: &[CrashEvent], now: u64, cfg: &ThresholdConfig) -> u32 {
    log.iter()
        .filter(|event| within_window(event.timestamp, now, cfg.window_seconds))
        .count() as u32
}

/// Decide whether the current launch is part of a crash loop.
///
/// `log` holds the launches recorded *before* the current one. Returns true
/// iff at least `max_events - 1` of them fall inside the window, i.e. the
/// current launch would be the `max_events`-th rapid restart.
#[must_use]
pub fn is_crash_loop(log: &[CrashEvent], now: u64, cfg: &ThresholdConfig) -> bool {
    let cfg = cfg.normalized();
    launches_in_window(log, now, &cfg) >= cfg.prior_threshold()
}

/// Diagnostic summary of a detector evaluation, logged by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashLoopDiagnostics {
    /// Prior launches considered.
    pub history_len: usize,
    /// Prior launches inside the window.
    pub in_window: u32,
    /// Threshold that `in_window` was compared against.
    pub threshold: u32,
    /// Most recent prior launch, if any.
    pub last_launch_at: Option<u64>,
    /// The verdict.
    pub in_crash_loop: bool,
}

/// Evaluate the detector and return the full diagnostic picture.
#[must_use]
pub fn diagnose(log: &[CrashEvent], now: u64, cfg: &ThresholdConfig) -> CrashLoopDiagnostics {
    let cfg = cfg.normalized();
    let in_window = launches_in_window(log, now, &cfg);
    let threshold = cfg.prior_threshold();
    CrashLoopDiagnostics {
        history_len: log.len(),
        in_window,
        threshold,
        last_launch_at: log.last().map(|event| event.timestamp),
        in_crash_loop: in_window >= threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(ts: &[u64]) -> Vec<CrashEvent> {
        ts.iter().map(|&t| CrashEvent::new(t)).collect()
    }

    fn cfg(max_events: u32, window_seconds: u64) -> ThresholdConfig {
        ThresholdConfig {
            max_events,
            window_seconds,
        }
    }

    #[test]
    fn threshold_config_defaults() {
        let config = ThresholdConfig::default();
        assert_eq!(config.max_events, 3);
        assert_eq!(config.window_seconds, 10);
    }

    #[test]
    fn threshold_config_deserializes_partial_toml() {
        let parsed: ThresholdConfig = toml::from_str("max_events = 5").unwrap();
        assert_eq!(parsed.max_events, 5);
        assert_eq!(parsed.window_seconds, 10);
    }

    #[test]
    fn normalized_clamps_degenerate_values() {
        let normalized = cfg(0, 0).normalized();
        assert_eq!(normalized.max_events, MIN_MAX_EVENTS);
        assert_eq!(normalized.window_seconds, 1);
    }

    #[test]
    fn empty_history_is_never_a_loop() {
        assert!(!is_crash_loop(&[], 1_000, &ThresholdConfig::default()));
    }

    #[test]
    fn rapid_launches_trip_on_third() {
        let config = cfg(3, 10);
        // t=0 and t=3 already recorded; current launch at t=6.
        assert!(!is_crash_loop(&events(&[1_000]), 1_003, &config));
        assert!(is_crash_loop(&events(&[1_000, 1_003]), 1_006, &config));
    }

    #[test]
    fn spaced_launches_never_trip() {
        let config = cfg(3, 10);
        assert!(!is_crash_loop(&events(&[1_000]), 1_015, &config));
        assert!(!is_crash_loop(&events(&[1_000, 1_015]), 1_030, &config));
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let config = cfg(2, 10);
        assert!(!is_crash_loop(&events(&[1_000]), 1_010, &config));
        assert!(is_crash_loop(&events(&[1_000]), 1_009, &config));
    }

    #[test]
    fn future_timestamps_count_as_recent() {
        let config = cfg(2, 10);
        assert!(is_crash_loop(&events(&[2_000]), 1_000, &config));
    }

    #[test]
    fn old_entries_outside_window_not_counted() {
        let config = cfg(3, 60);
        let history = events(&[100, 200, 300, 1_000]);
        assert_eq!(launches_in_window(&history, 1_010, &config), 1);
        assert!(!is_crash_loop(&history, 1_010, &config));
    }

    #[test]
    fn diagnostics_reflect_verdict() {
        let config = cfg(3, 10);
        let diag = diagnose(&events(&[990, 1_000, 1_004]), 1_005, &config);
        assert_eq!(diag.history_len, 3);
        assert_eq!(diag.in_window, 2);
        assert_eq!(diag.threshold, 2);
        assert_eq!(diag.last_launch_at, Some(1_004));
        assert!(diag.in_crash_loop);
    }
}
