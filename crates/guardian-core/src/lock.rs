//! Keeper service single-instance guard.
//!
//! `supervisor-keeper service` takes an exclusive `flock` on `keeper.lock`
//! and writes its pid into that same file. The kernel drops the flock with
//! the process, so a crashed loop never blocks its own restart and no stale
//! lock needs cleaning up. One-shot `reconcile` runs never take it; they
//! overlap with the service safely through atomic renames.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::{Error, Result};

/// Held for the lifetime of a service loop.
#[derive(Debug)]
pub struct ServiceLock {
    _file: File,
    path: PathBuf,
}

impl ServiceLock {
    /// Take the lock without blocking and record this process as the holder.
    ///
    /// Fails with [`Error::Service`] naming the holder when another loop is
    /// already running.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = open_lock_file(path, true)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e.into());
            }
            let message = match read_pid(&mut file) {
                Some(pid) => format!("keeper service already running (pid {pid})"),
                None => "keeper service already running".to_string(),
            };
            return Err(Error::Service(message));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        tracing::debug!(path = %path.display(), "Holding keeper service lock");

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid of the running service loop, if one holds the lock.
///
/// A pid left in the file by a loop that has exited is ignored: only a held
/// lock counts.
#[must_use]
pub fn service_holder(path: &Path) -> Option<u32> {
    let mut file = open_lock_file(path, false).ok()?;
    match FileExt::try_lock_shared(&file) {
        // Free; dropping the file releases our probe lock
        Ok(()) => None,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => read_pid(&mut file),
        Err(_) => None,
    }
}

fn open_lock_file(path: &Path, create: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
