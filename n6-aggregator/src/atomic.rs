//! Crash-safe replacement of state files.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::AggregatorError;

/// A temporary file that atomically replaces `target` when committed.
///
/// The temporary file is created in the directory of the target, so that the final rename does
/// not cross file systems. Dropping an uncommitted file removes it.
#[derive(Debug)]
pub struct AtomicFile {
    target: PathBuf,
    temp: NamedTempFile,
}

impl AtomicFile {
    /// Creates a temporary file next to `target`.
    pub fn new(target: &Path) -> Result<Self, AggregatorError> {
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(".n6-aggregator-")
            .tempfile_in(dir)
            .map_err(|e| AggregatorError::persistence(dir, e))?;

        Ok(Self {
            target: target.to_owned(),
            temp,
        })
    }

    /// The file that is replaced on commit.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flushes the written contents to disk.
    pub fn sync(&self) -> Result<(), AggregatorError> {
        self.temp
            .as_file()
            .sync_all()
            .map_err(|e| AggregatorError::persistence(self.temp.path(), e))
    }

    /// Syncs the contents and renames the temporary file over the target.
    pub fn commit(self) -> Result<(), AggregatorError> {
        self.sync()?;

        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| AggregatorError::persistence(&target, e.error))?;

        sync_parent(&target);
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl Seek for AtomicFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.temp.seek(pos)
    }
}

/// Makes a rename durable. Failures are logged only, since the rename itself already happened.
fn sync_parent(path: &Path) {
    let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return;
    };

    if let Err(error) = File::open(dir).and_then(|dir| dir.sync_all()) {
        n6_log::warn!(
            error = &error as &dyn std::error::Error,
            directory = %dir.display(),
            "failed to sync directory",
        );
    }
}

/// Writes `bytes` to `target`, replacing it atomically.
pub fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), AggregatorError> {
    let mut file = AtomicFile::new(target)?;
    file.write_all(bytes)
        .map_err(|e| AggregatorError::persistence(target, e))?;
    file.commit()
}

/// Number of live [`SigintGuard`]s and the `SIGINT` action they replaced.
#[cfg(unix)]
static SIGINT_IGNORED: Mutex<(usize, Option<libc::sigaction>)> = Mutex::new((0, None));

/// Keeps `SIGINT` ignored by the whole process while alive.
///
/// Used around the renames that replace the state, so that an interrupt cannot land between
/// them. An interrupt arriving meanwhile is discarded. Guards may overlap, also across threads;
/// the previous action is restored once the last guard is dropped.
#[derive(Debug)]
pub struct SigintGuard {
    _private: (),
}

impl SigintGuard {
    /// Ignores `SIGINT` until the guard is dropped.
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            let mut state = SIGINT_IGNORED.lock();
            if state.0 == 0 {
                state.1 = ignore_sigint();
            }
            state.0 += 1;
        }

        Self { _private: () }
    }
}

impl Default for SigintGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl Drop for SigintGuard {
    fn drop(&mut self) {
        let mut state = SIGINT_IGNORED.lock();
        state.0 = state.0.saturating_sub(1);

        if state.0 == 0
            && let Some(previous) = state.1.take()
        {
            // SAFETY: restores the action saved by `ignore_sigint`.
            unsafe {
                libc::sigaction(libc::SIGINT, &previous, std::ptr::null_mut());
            }
        }
    }
}

/// Sets the action of `SIGINT` to ignore and returns the previous one.
#[cfg(unix)]
fn ignore_sigint() -> Option<libc::sigaction> {
    // SAFETY: all-zero is a valid `sigaction`; the relevant fields are set below.
    let mut ignore: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    ignore.sa_sigaction = libc::SIG_IGN;

    // SAFETY: both structs outlive the calls.
    let result = unsafe {
        libc::sigemptyset(&mut ignore.sa_mask);
        libc::sigaction(libc::SIGINT, &ignore, &mut previous)
    };

    if result != 0 {
        n6_log::warn!(
            error = &io::Error::last_os_error() as &dyn std::error::Error,
            "failed to ignore SIGINT",
        );
        return None;
    }

    Some(previous)
}
