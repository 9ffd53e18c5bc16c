//! Request and completion entry types.
//!
//! These are the *lingua franca* between the engine and the kernel
//! queue backends. `IoOp` mirrors what goes into an `iocb`/SQE,
//! `IoEvent` mirrors what comes out of an `io_event`/CQE.

use std::fmt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

/// Request identity.
///
/// Assigned monotonically by the request queue and never reused.
/// Stored in the kernel's user-data field (`aio_data` / `user_data`)
/// for zero-lookup routing of completions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Sentinel: never assigned to a request.
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "RequestId(NONE)")
        } else {
            write!(f, "RequestId({})", self.0)
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

/// Request lifecycle.
///
/// ```text
/// Submitted ──(reactor resolves)──▶ Completed ──(caller takes)──▶ Retrieved
/// ```
///
/// `Retrieved` requests are removed from the table, so the queue only
/// ever reports the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Submitted,
    Completed,
    Retrieved,
}

/// Outcome of one request: bytes transferred, or the kernel's errno.
pub type IoStatus = std::result::Result<usize, Errno>;

/// One kernel operation, ready for `AioBackend::submit`.
#[derive(Debug, Clone, Copy)]
pub struct IoOp {
    pub id: RequestId,
    pub kind: OpKind,
    pub fd: RawFd,
    pub offset: u64,
    /// Buffer start. For reads the kernel writes here, for writes it reads.
    pub buf: *mut u8,
    pub len: usize,
}

// Safety: an IoOp is plain data; the submitter guarantees the buffer
// outlives the operation (see `AioBackend::submit`).
unsafe impl Send for IoOp {}
unsafe impl Sync for IoOp {}

/// A completion as reported by the kernel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub id: RequestId,
    /// Byte count, or negative errno.
    pub res: i64,
}

impl IoEvent {
    pub const EMPTY: Self = Self { id: RequestId::NONE, res: 0 };

    /// Decode the raw kernel result.
    #[inline]
    pub fn status(&self) -> IoStatus {
        if self.res < 0 {
            Err(Errno::from_raw((-self.res) as i32))
        } else {
            Ok(self.res as usize)
        }
    }
}
