//! Append-only crash log.
//!
//! One record per line:
//!
//! ```text
//! 1700000000          # launch event (unix seconds)
//! reset 1700000042    # reset marker, not an event
//! ```
//!
//! Appends use a single `O_APPEND` write so concurrent launches from several
//! terminal tabs interleave whole lines and never rewrite each other. The
//! file is only ever replaced wholesale (reset) or renamed aside (rotation),
//! never edited in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix of a reset marker line.
const RESET_MARKER: &str = "reset";

/// Suffix used for the rotated log.
const ROTATED_EXTENSION: &str = "old";

/// A single supervised launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrashEvent {
    /// Unix seconds at which the launch began.
    pub timestamp: u64,
}

impl CrashEvent {
    #[must_use]
    pub const fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

/// A parsed crash log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    Event(CrashEvent),
    Reset(u64),
}

/// Parse one line of the crash log.
pub fn parse_record(line: &str) -> Result<LogRecord> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix(RESET_MARKER) {
        let ts = rest
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::LogCorruption(format!("bad reset marker {trimmed:?}: {e}")))?;
        return Ok(LogRecord::Reset(ts));
    }
    trimmed
        .parse::<u64>()
        .map(|ts| LogRecord::Event(CrashEvent::new(ts)))
        .map_err(|e| Error::LogCorruption(format!("bad event line {trimmed:?}: {e}")))
}

/// Events parsed from log text plus the number of lines that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLog {
    pub events: Vec<CrashEvent>,
    pub malformed: usize,
}

/// Parse log contents, skipping blank and malformed lines.
#[must_use]
pub fn parse_log(contents: &str) -> ParsedLog {
    let mut parsed = ParsedLog::default();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(line) {
            Ok(LogRecord::Event(event)) => parsed.events.push(event),
            Ok(LogRecord::Reset(_)) => {}
            Err(_) => parsed.malformed += 1,
        }
    }
    parsed
}

/// File-backed crash log at a fixed path.
#[derive(Debug, Clone)]
pub struct CrashLogStore {
    path: PathBuf,
    max_bytes: u64,
}

impl CrashLogStore {
    /// Create a store for `path`, rotating once the file exceeds `max_bytes`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    /// Path of the live log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rotated log file.
    #[must_use]
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(ROTATED_EXTENSION);
        PathBuf::from(name)
    }

    /// Append one launch event.
    ///
    /// The line is emitted with a single `write` on an `O_APPEND` descriptor.
    /// If the file ends in a torn record the line is prefixed with a newline,
    /// so the new timestamp is never glued onto the fragment.
    pub fn append(&self, now: u64) -> Result<()> {
        self.ensure_parent()?;
        self.rotate_if_needed();

        let mut file = open_append(&self.path)?;
        let line = if ends_mid_line(&mut file)? {
            format!("\n{now}\n")
        } else {
            format!("{now}\n")
        };
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Return up to the last `n` events in original order.
    ///
    /// A missing file is an empty log; malformed lines are skipped with a
    /// warning.
    pub fn recent(&self, n: usize) -> Result<Vec<CrashEvent>> {
        let mut parsed = ParsedLog::default();
        for path in [self.rotated_path(), self.path.clone()] {
            match fs::read(&path) {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let chunk = parse_log(&text);
                    parsed.events.extend(chunk.events);
                    parsed.malformed += chunk.malformed;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if parsed.malformed > 0 {
            tracing::warn!(
                path = %self.path.display(),
                skipped = parsed.malformed,
                "Skipped malformed crash log lines"
            );
        }

        let skip = parsed.events.len().saturating_sub(n);
        Ok(parsed.events.split_off(skip))
    }

    /// Replace the log with a single reset marker.
    ///
    /// The marker is written to a sibling temp file and renamed over the log,
    /// so readers see either the old history or the fresh baseline.
    pub fn reset(&self, now: u64) -> Result<()> {
        self.ensure_parent()?;
        let tmp = self.path.with_extension(format!("reset.{}", std::process::id()));
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{RESET_MARKER} {now}")?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        match fs::remove_file(self.rotated_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "Failed to remove rotated crash log"),
        }
        tracing::debug!(path = %self.path.display(), "Crash log reset");
        Ok(())
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Rename an oversized log aside. Failures are logged and ignored.
    fn rotate_if_needed(&self) {
        let Ok(meta) = fs::metadata(&self.path) else {
            return;
        };
        if meta.len() <= self.max_bytes {
            return;
        }
        if let Err(e) = self.rotate() {
            tracing::warn!(error = %e, "Failed to rotate crash log");
        }
    }

    /// Move the live log aside under a unique name, then decide where it goes.
    ///
    /// Two launches can both see an oversized log. The second one then claims
    /// the fresh log the first one started; that small file is appended back
    /// to the live log instead of replacing `.old`, so no history is lost.
    fn rotate(&self) -> io::Result<()> {
        let claimed = self.path.with_extension(format!(
            "rotate.{}.{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        let size = fs::metadata(&claimed)?.len();
        if size > self.max_bytes {
            fs::rename(&claimed, self.rotated_path())?;
            tracing::debug!(path = %self.path.display(), size, "Rotated crash log");
            return Ok(());
        }

        let contents = fs::read(&claimed)?;
        if !contents.is_empty() {
            let mut restored = contents;
            if restored.last() != Some(&b'\n') {
                restored.push(b'\n');
            }
            open_append(&self.path)?.write_all(&restored)?;
        }
        fs::remove_file(&claimed)?;
        tracing::debug!(path = %self.path.display(), "Crash log already rotated; kept fresh entries");
        Ok(())
    }
}

/// Whether the last byte of a non-empty file is something other than `\n`.
fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(unix)]
fn open_append(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CrashLogStore {
        CrashLogStore::new(dir.path().join("state").join("crash.log"), 10 * 1024)
    }

    #[test]
    fn parse_record_event_and_marker() {
        assert_eq!(
            parse_record("1700000000").unwrap(),
            LogRecord::Event(CrashEvent::new(1_700_000_000))
        );
        assert_eq!(
            parse_record("reset 1700000042\n").unwrap(),
            LogRecord::Reset(1_700_000_042)
        );
        assert!(matches!(
            parse_record("17000garbage"),
            Err(Error::LogCorruption(_))
        ));
        assert!(parse_record("reset soon").is_err());
    }

    #[test]
    fn parse_log_skips_malformed_and_markers() {
        let parsed = parse_log("reset 10\n11\n\nnot-a-number\n12\n13");
        assert_eq!(
            parsed.events,
            vec![CrashEvent::new(11), CrashEvent::new(12), CrashEvent::new(13)]
        );
        assert_eq!(parsed.malformed, 1);
    }

    #[test]
    fn recent_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).recent(10).unwrap().is_empty());
    }

    #[test]
    fn append_creates_parent_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        log.append(100).unwrap();
        log.append(105).unwrap();
        log.append(110).unwrap();
        let events = log.recent(10).unwrap();
        assert_eq!(
            events,
            vec![CrashEvent::new(100), CrashEvent::new(105), CrashEvent::new(110)]
        );
    }

    #[test]
    fn recent_returns_trailing_window() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        for ts in 0..10 {
            log.append(ts).unwrap();
        }
        let events = log.recent(3).unwrap();
        assert_eq!(
            events,
            vec![CrashEvent::new(7), CrashEvent::new(8), CrashEvent::new(9)]
        );
    }

    #[test]
    fn recent_tolerates_torn_trailing_line() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        log.append(100).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"17000").unwrap();
        file.write_all(&[0xff, 0xfe]).unwrap();
        let events = log.recent(10).unwrap();
        assert_eq!(events, vec![CrashEvent::new(100)]);
    }

    #[test]
    fn append_after_torn_line_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(log.path(), b"17000").unwrap();

        log.append(1_000_000).unwrap();
        log.append(1_000_060).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "17000\n1000000\n1000060\n");
        let stamps: Vec<u64> = log.recent(10).unwrap().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![17_000, 1_000_000, 1_000_060]);
    }

    #[test]
    fn torn_line_does_not_fake_a_crash_loop() {
        use crate::crash::{ThresholdConfig, is_crash_loop};

        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(log.path(), b"17000").unwrap();
        let cfg = ThresholdConfig {
            max_events: 3,
            window_seconds: 10,
        };

        let t = 1_700_000_000;
        for now in [t, t + 60, t + 61] {
            let prior = log.recent(100).unwrap();
            log.append(now).unwrap();
            assert!(!is_crash_loop(&prior, now, &cfg), "diverted at {now}");
        }
    }

    #[test]
    fn reset_leaves_single_marker() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        log.append(100).unwrap();
        log.append(101).unwrap();
        log.reset(102).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "reset 102\n");
        assert!(log.recent(10).unwrap().is_empty());

        log.append(200).unwrap();
        assert_eq!(log.recent(10).unwrap(), vec![CrashEvent::new(200)]);
    }

    #[test]
    fn rotation_keeps_history_visible() {
        let dir = TempDir::new().unwrap();
        let log = CrashLogStore::new(dir.path().join("crash.log"), 16);
        for ts in 1_000..1_006 {
            log.append(ts).unwrap();
        }
        assert_eq!(log.rotated_path(), dir.path().join("crash.log.old"));
        assert!(log.rotated_path().exists());
        let events = log.recent(100).unwrap();
        let stamps: Vec<u64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, (1_000..1_006).collect::<Vec<_>>());
    }

    #[test]
    fn overlapping_rotation_keeps_rotated_history() {
        let dir = TempDir::new().unwrap();
        let log = CrashLogStore::new(dir.path().join("crash.log"), 16);
        for ts in 1_000..1_005 {
            log.append(ts).unwrap();
        }
        assert!(log.rotated_path().exists());
        let rotated = fs::read_to_string(log.rotated_path()).unwrap();

        // A second launcher that saw the oversized log before the first
        // rotation now rotates the fresh one
        log.rotate().unwrap();

        assert_eq!(fs::read_to_string(log.rotated_path()).unwrap(), rotated);
        let stamps: Vec<u64> = log.recent(100).unwrap().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, (1_000..1_005).collect::<Vec<_>>());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("rotate"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn reset_discards_rotated_history() {
        let dir = TempDir::new().unwrap();
        let log = CrashLogStore::new(dir.path().join("crash.log"), 8);
        for ts in 1_000..1_004 {
            log.append(ts).unwrap();
        }
        assert!(log.rotated_path().exists());
        log.reset(2_000).unwrap();
        assert!(!log.rotated_path().exists());
        assert!(log.recent(100).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn log_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let log = store(&dir);
        log.append(1).unwrap();
        let mode = fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
