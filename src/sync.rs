use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::DispatchError;

/// An exclusive advisory lock (`flock`) on a lock file that is never removed.
///
/// The kernel releases the lock when the holder closes the file or dies, so a crashed
/// holder never leaves the lock behind. The file records the last holder's pid for
/// diagnostics only. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    lock_path: PathBuf,
}

impl LockedFile {
    /// Makes one attempt to take the lock. Returns `StoreBusy` if another holder has it.
    pub fn try_acquire(lock_path: &Path) -> Result<Self, DispatchError> {
        let io_error = |source| DispatchError::StoreIo {
            path: lock_path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(io_error)?;

        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Err(DispatchError::StoreBusy(
                    format!("{} is held by another process", lock_path.display()),
                )),
                _ => Err(io_error(err)),
            };
        }

        let mut lock = Self {
            file,
            lock_path: lock_path.to_path_buf(),
        };
        lock.record_holder().map_err(io_error)?;
        Ok(lock)
    }

    fn record_holder(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // Closing the file releases the lock as well; unlocking first keeps the window short.
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(lock = %self.lock_path.display(), "Released lock");
    }
}
