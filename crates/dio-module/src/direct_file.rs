//! Opening files for direct I/O.

use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;

use dio_core::error::{DioError, Result};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;

/// Open `path` with `O_DIRECT`, read-only or read-write.
///
/// Fails with `Os(EINVAL)` on filesystems without direct I/O (tmpfs).
pub fn open_direct<P: AsRef<Path>>(path: P, writable: bool) -> Result<OwnedFd> {
    let access = if writable { OFlag::O_RDWR } else { OFlag::O_RDONLY };
    let flags = access | OFlag::O_DIRECT | OFlag::O_CLOEXEC;
    let fd = fcntl::open(path.as_ref(), flags, Mode::empty()).map_err(DioError::Os)?;
    // Safety: open() returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
