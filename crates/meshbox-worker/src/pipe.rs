//! Named-pipe discipline for the checkpoint/restore helper.
//!
//! The helper is driven by writing a container name onto a well-known named pipe and,
//! for a dedup restore-pause signal, reading the two CRIU pids it reports back. Exactly
//! one dump or restore sequence may be in flight against that pipe at a time: the whole
//! sequence — the pipe write *and* whatever runtime call actually triggers the
//! helper, plus any pid read that follows it — must happen while holding
//! [`DumpPipe`]'s single mutex, not just the write. [`DumpPipe::lock`] returns a
//! [`DumpPipeGuard`] scoped to exactly that sequence so call sites can't accidentally
//! narrow it back down to the write alone. A second, independent mutex in
//! [`RestorePids`] guards delivery of the restore-completion signal (parking and later
//! killing the helper process), so that tearing down a parked restore never races a
//! dump in progress.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};

use crate::error::WorkerError;

/// Guards the checkpoint/restore helper's command pipe.
#[derive(Debug)]
pub struct DumpPipe {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DumpPipe {
    /// Opens a dump pipe at `path`. The pipe itself is not opened until a write or read
    /// is issued through a [`DumpPipeGuard`]; named pipes block on open until a reader
    /// (or writer) is present on the other end.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    /// Acquires exclusive use of the pipe for one full checkpoint/restore sequence.
    /// Hold the returned guard across the pipe write, the runtime call that triggers
    /// the helper, and any pid read — releasing it early reopens the race this type
    /// exists to close.
    pub fn lock(&self) -> DumpPipeGuard<'_> {
        DumpPipeGuard { path: &self.path, _guard: self.write_lock.lock() }
    }
}

/// Exclusive access to a [`DumpPipe`] for the duration of one checkpoint or restore
/// sequence.
#[derive(Debug)]
pub struct DumpPipeGuard<'a> {
    path: &'a Path,
    _guard: MutexGuard<'a, ()>,
}

impl DumpPipeGuard<'_> {
    /// Writes `cont<id>` onto the pipe.
    pub fn write(&self, container_name: &str) -> Result<(), WorkerError> {
        write_command(self.path, container_name)
    }

    /// Reads the two space-separated CRIU pids the helper reports after a dedup
    /// restore-pause signal (the cloned CRIU process and the root restore process),
    /// matching the helper's `ReadFromCRIUPipe(true)` response format.
    pub fn read_pids(&self) -> Result<(u32, u32), WorkerError> {
        let text = read_completion(self.path)?;
        parse_pid_pair(&text)
    }
}

/// The fixed path the non-dedup warm-restore path reads its completion marker from.
pub const WARM_RESTORE_FIFO: &str = "/tmp/restore_fifo";

/// Reads a null-terminated completion marker back from a pipe, used by both the dump
/// path (reading from the sandbox's own pipe) and the warm-restore path (reading from
/// [`WARM_RESTORE_FIFO`]).
pub fn read_completion(path: &Path) -> Result<String, WorkerError> {
    let mut pipe = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|err| WorkerError::HelperFailure(format!("open {}: {err}", path.display())))?;
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    Ok(text.trim_end_matches('\0').trim().to_owned())
}

/// Parses a `"<cloned_pid> <root_pid>"` response, the format the helper writes back
/// on a dedup restore-pause signal. Either field missing or non-numeric is a
/// `HelperFailure`, matching the original's treatment of an unparseable pid response
/// as a reason to blacklist and purge the sandbox rather than retry in place.
fn parse_pid_pair(text: &str) -> Result<(u32, u32), WorkerError> {
    let mut parts = text.split_whitespace();
    let cloned = parts.next().and_then(|p| p.parse::<u32>().ok());
    let root = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (cloned, root) {
        (Some(cloned_pid), Some(root_pid)) => Ok((cloned_pid, root_pid)),
        _ => Err(WorkerError::HelperFailure(format!(
            "received invalid pid(s) from checkpoint/restore helper: {text:?}"
        ))),
    }
}

fn write_command(path: &Path, container_name: &str) -> Result<(), WorkerError> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| WorkerError::HelperFailure(format!("open {}: {err}", path.display())))?;
    pipe.write_all(container_name.as_bytes())?;
    Ok(())
}

/// Tracks helper pids parked for a paused restore, guarded independently of
/// [`DumpPipe`]'s write lock so a purge's teardown never blocks on, or races, an
/// in-flight dump.
#[derive(Debug, Default)]
pub struct RestorePids {
    pids: Mutex<Vec<u32>>,
}

impl RestorePids {
    /// Records a helper pid parked while waiting to complete a restore.
    pub fn park(&self, pid: u32) {
        self.pids.lock().push(pid);
    }

    /// Removes and returns every parked pid, for the caller to signal or kill.
    pub fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut *self.pids.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── 1. restore pids park and drain in FIFO order, drain empties the set ──
    #[test]
    fn restore_pids_park_and_drain() {
        let pids = RestorePids::default();
        pids.park(10);
        pids.park(11);
        assert_eq!(pids.drain(), vec![10, 11]);
        assert!(pids.drain().is_empty());
    }

    // ── 2. dump pipe serializes concurrent writers ──
    #[test]
    fn dump_pipe_write_lock_is_exclusive() {
        let pipe = DumpPipe::new("/nonexistent/pipe/for/lock/test");
        let _guard = pipe.write_lock.lock();
        assert!(pipe.write_lock.try_lock().is_none());
    }

    // ── 3. a held DumpPipeGuard excludes a second lock() call ──
    #[test]
    fn dump_pipe_guard_excludes_concurrent_sequences() {
        let pipe = DumpPipe::new("/nonexistent/pipe/for/lock/test");
        let _guard = pipe.lock();
        assert!(pipe.write_lock.try_lock().is_none());
    }

    // ── 4. parses a well-formed "cloned root" pid pair ──
    #[test]
    fn parses_pid_pair() {
        assert_eq!(parse_pid_pair("1234 5678").expect("parse"), (1234, 5678));
    }

    // ── 5. a missing or non-numeric pid is a helper failure, not a panic ──
    #[test]
    fn rejects_malformed_pid_pair() {
        assert!(parse_pid_pair("1234").is_err());
        assert!(parse_pid_pair("abc def").is_err());
        assert!(parse_pid_pair("").is_err());
    }
}
