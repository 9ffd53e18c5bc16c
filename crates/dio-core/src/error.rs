//! Engine error types.

use nix::errno::Errno;

use crate::entry::RequestId;

/// Errors surfaced by the engine and its components.
///
/// Per-request kernel failures (a read returning `EIO`, say) are not
/// engine errors; they travel in the request's [`IoStatus`](crate::IoStatus).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DioError {
    /// Aligned allocation failed.
    #[error("out of memory: {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },

    /// Operation not valid in the current state (double release, zero-length
    /// request, poisoned engine, ...).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Maximum concurrent depth reached.
    #[error("queue full: {depth} requests in flight")]
    QueueFull { depth: usize },

    /// No such request in the table.
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// Request has not completed yet.
    #[error("request {0} not ready")]
    NotReady(RequestId),

    /// Kernel completion interface failed. The kernel queue handle is suspect.
    #[error("reactor: {0}")]
    Reactor(Errno),

    /// Kernel rejected queue setup.
    #[error("kernel queue setup failed: {0}")]
    Init(Errno),

    /// Submission rejected by the kernel as a whole.
    #[error("submit: {0}")]
    Submit(Errno),

    /// Deadline elapsed before the request completed.
    #[error("timed out")]
    Timeout,

    /// Teardown found requests still in flight.
    #[error("{outstanding} requests outstanding at shutdown ({abandoned} abandoned)")]
    ResourceLeak { outstanding: usize, abandoned: usize },

    /// OS error from a helper (open, sysconf).
    #[error("OS error: {0}")]
    Os(Errno),
}

impl DioError {
    /// Errors that imply corrupted bookkeeping or a broken kernel queue.
    /// The engine refuses further work after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownRequest(_) | Self::Reactor(_))
    }

    /// Teardown completed but reported something worth logging.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::ResourceLeak { .. })
    }
}

pub type Result<T> = std::result::Result<T, DioError>;
