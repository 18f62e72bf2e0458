use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::core::{Error, Result};

/// Exclusive advisory lock on a region's backing file.
///
/// `flock` locks belong to the open file description, so two handles that
/// opened the same file separately exclude each other even inside one
/// process. The lock is released when the guard drops.
pub struct RegionLock<'a> {
    file: &'a File,
}

impl<'a> RegionLock<'a> {
    pub fn acquire(file: &'a File) -> Result<Self> {
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == 0 {
                return Ok(Self { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        }
    }

    pub fn try_acquire(file: &'a File) -> Result<Option<Self>> {
        // SAFETY: as in `acquire`.
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res == 0 {
            return Ok(Some(Self { file }));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        Err(Error::Io(err))
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard borrows the file, so the descriptor is still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
