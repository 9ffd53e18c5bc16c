//! Kernel asynchronous I/O queue abstraction.
//!
//! An `AioBackend` owns one kernel queue (an AIO context or an io_uring
//! instance) and exposes the setup/submit/getevents/cancel/destroy
//! contract the engine is built on.
//!
//! # Implementors
//!
//! - `LinuxAio` (default): `io_setup()` / `io_submit()` / `io_getevents()`
//!   / `io_cancel()` / `io_destroy()` raw syscalls. Native async only for
//!   `O_DIRECT` descriptors; buffered descriptors complete synchronously
//!   inside `io_submit()`.
//!
//! - `UringBackend`: io_uring via the `io-uring` crate. Async for both
//!   direct and buffered descriptors. Needs a kernel (5.11+) and a
//!   sandbox that allow `io_uring_setup`.
//!
//! - `KernelQueue`: enum over both, chosen at runtime from `BackendKind`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::entry::{IoEvent, IoOp, RequestId};
use crate::error::Result;

/// Result of a cancellation attempt. Always advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The kernel cancelled the operation and handed its completion back
    /// directly. It will NOT show up in `get_events()`.
    Cancelled(IoEvent),
    /// The kernel accepted the cancel request. The operation's completion
    /// (often `-ECANCELED`, possibly a normal result) arrives through
    /// `get_events()` as usual.
    Pending,
    /// The kernel refused (e.g. `EINVAL` for in-flight direct I/O,
    /// `EAGAIN` when the operation already finished).
    Refused(Errno),
}

/// Asynchronous I/O submission and completion against one kernel queue.
///
/// All methods take `&self`: submission may happen from several threads
/// while one thread is blocked in `get_events()`. Implementations
/// serialize internally where the kernel interface requires it.
///
/// **Contract:**
/// - `submit()` never blocks waiting for completions.
/// - `get_events()` is the single blocking point. The engine guarantees
///   at most one caller at a time.
/// - Every accepted `IoOp` produces exactly one `IoEvent` (via
///   `get_events()` or `CancelOutcome::Cancelled`), unless the queue is
///   destroyed first.
pub trait AioBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Hand a batch of operations to the kernel.
    ///
    /// Returns how many leading entries of `ops` were accepted. A partial
    /// count is not an error; the rest were never seen by the kernel.
    /// Fails (`Submit`/`QueueFull`) only if none were accepted.
    ///
    /// # Safety
    ///
    /// Every `op.buf` must point to `op.len` bytes that stay valid (and,
    /// for reads, unaliased) until the operation's completion has been
    /// returned by `get_events()`/`cancel()`. If the queue is destroyed
    /// first the buffer must never be freed: teardown may complete
    /// asynchronously in the kernel.
    unsafe fn submit(&self, ops: &[IoOp]) -> Result<usize>;

    /// Wait for at least `min` completions (or until `timeout`), then
    /// retrieve up to `out.len()` of them into `out`.
    ///
    /// `timeout == None` waits indefinitely. Returns the number written;
    /// 0 means the timeout expired. Interrupted waits are retried.
    /// Errors are kernel interface failures and are fatal.
    fn get_events(&self, min: usize, out: &mut [IoEvent], timeout: Option<Duration>) -> Result<usize>;

    /// Best-effort cancellation of an in-flight operation.
    fn cancel(&self, id: RequestId) -> Result<CancelOutcome>;

    /// Operations accepted but not yet reported complete.
    fn inflight(&self) -> usize;

    /// Queue depth requested at setup.
    fn depth(&self) -> usize;

    /// Release the kernel queue. Idempotent: only the first call reaches
    /// the kernel. Other methods fail with `InvalidState` afterwards.
    fn destroy(&mut self) -> Result<()>;
}

/// Which kernel queue to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Linux native AIO (io_setup family).
    #[default]
    LinuxAio,
    /// io_uring.
    Uring,
}

/// Deadline for a wait of `timeout` starting now.
///
/// `None` means unbounded: no timeout, or one too large for the clock to
/// represent (`Duration::MAX` as "forever").
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Time left until `deadline`, `None` if unbounded.
pub fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinuxAio => write!(f, "aio"),
            Self::Uring => write!(f, "uring"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aio" | "linux-aio" | "libaio" => Ok(Self::LinuxAio),
            "uring" | "io_uring" | "io-uring" => Ok(Self::Uring),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("aio".parse(), Ok(BackendKind::LinuxAio));
        assert_eq!("LIBAIO".parse(), Ok(BackendKind::LinuxAio));
        assert_eq!("io_uring".parse(), Ok(BackendKind::Uring));
        assert_eq!("uring".parse(), Ok(BackendKind::Uring));
        assert_eq!("epoll".parse::<BackendKind>(), Err(()));
    }

    #[test]
    fn test_backend_kind_display_roundtrip() {
        for kind in [BackendKind::LinuxAio, BackendKind::Uring] {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
        assert_eq!(BackendKind::default(), BackendKind::LinuxAio);
    }

    #[test]
    fn test_deadline_after() {
        assert!(deadline_after(None).is_none());
        assert!(deadline_after(Some(Duration::MAX)).is_none());
        assert!(time_left(None).is_none());

        let d = deadline_after(Some(Duration::ZERO));
        assert_eq!(time_left(d), Some(Duration::ZERO));

        let d = deadline_after(Some(Duration::from_secs(60)));
        let left = time_left(d).unwrap();
        assert!(left > Duration::from_secs(59) && left <= Duration::from_secs(60));
    }
}
