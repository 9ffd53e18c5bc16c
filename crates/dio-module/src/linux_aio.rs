//! `LinuxAio` — default `AioBackend` implementation.
//!
//! Linux native AIO through raw syscalls: one `aio_context_t` created by
//! `io_setup()`, batches handed over with `io_submit()`, completions
//! reaped with `io_getevents()`, torn down with `io_destroy()`.
//!
//! Only `O_DIRECT` descriptors get truly asynchronous behaviour; on a
//! buffered descriptor the kernel performs the I/O inside `io_submit()`
//! and the completion is ready immediately. Both are correct.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dio_core::backend::{deadline_after, time_left, AioBackend, CancelOutcome};
use dio_core::entry::{IoEvent, IoOp, OpKind, RequestId};
use dio_core::error::{DioError, Result};
use nix::errno::Errno;

use crate::aio_sys::{self, AioContext, Iocb};

pub struct LinuxAio {
    ctx: AioContext,
    depth: usize,
    /// iocbs of accepted, not yet reaped operations, keyed by request id.
    /// Boxed: `io_cancel()` identifies an operation by the iocb address
    /// given to `io_submit()`, so it must not move.
    iocbs: Mutex<HashMap<u64, Box<Iocb>>>,
    /// Scratch space for `io_getevents()`.
    scratch: Mutex<Vec<aio_sys::IoEvent>>,
}

impl LinuxAio {
    /// Create a context able to hold `depth` simultaneous operations.
    ///
    /// Fails with `Init` when the kernel refuses (`EAGAIN` once
    /// `/proc/sys/fs/aio-max-nr` is exhausted, `ENOSYS` without AIO).
    pub fn new(depth: u32) -> Result<Self> {
        if depth == 0 {
            return Err(DioError::Init(Errno::EINVAL));
        }
        let mut ctx: AioContext = 0;
        aio_sys::io_setup(depth, &mut ctx).map_err(DioError::Init)?;
        tracing::debug!(depth, "linux-aio: context created");
        Ok(Self {
            ctx,
            depth: depth as usize,
            iocbs: Mutex::new(HashMap::with_capacity(depth as usize)),
            scratch: Mutex::new(Vec::with_capacity(depth as usize)),
        })
    }

    fn live_ctx(&self) -> Result<AioContext> {
        if self.ctx == 0 {
            return Err(DioError::InvalidState("kernel queue destroyed"));
        }
        Ok(self.ctx)
    }

    fn iocbs(&self) -> MutexGuard<'_, HashMap<u64, Box<Iocb>>> {
        self.iocbs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AioBackend for LinuxAio {
    fn name(&self) -> &'static str {
        "linux-aio"
    }

    unsafe fn submit(&self, ops: &[IoOp]) -> Result<usize> {
        let ctx = self.live_ctx()?;
        if ops.is_empty() {
            return Ok(0);
        }

        let mut iocbs = self.iocbs();
        let mut ptrs: Vec<*mut Iocb> = Vec::with_capacity(ops.len());
        for op in ops {
            if iocbs.contains_key(&op.id.0) {
                for prev in &ops[..ptrs.len()] {
                    iocbs.remove(&prev.id.0);
                }
                return Err(DioError::InvalidState("request id already in flight"));
            }
            let mut cb = Box::new(match op.kind {
                OpKind::Read => Iocb::pread(op.id.0, op.fd, op.buf, op.len, op.offset),
                OpKind::Write => Iocb::pwrite(op.id.0, op.fd, op.buf, op.len, op.offset),
            });
            ptrs.push(&mut *cb as *mut Iocb);
            iocbs.insert(op.id.0, cb);
        }

        match aio_sys::io_submit(ctx, &mut ptrs) {
            Ok(accepted) => {
                for op in &ops[accepted..] {
                    iocbs.remove(&op.id.0);
                }
                Ok(accepted)
            }
            Err(e) => {
                for op in ops {
                    iocbs.remove(&op.id.0);
                }
                match e {
                    Errno::EAGAIN => Err(DioError::QueueFull { depth: self.depth }),
                    other => Err(DioError::Submit(other)),
                }
            }
        }
    }

    fn get_events(&self, min: usize, out: &mut [IoEvent], timeout: Option<Duration>) -> Result<usize> {
        let ctx = self.live_ctx()?;
        if out.is_empty() {
            return Ok(0);
        }
        let min = min.min(out.len());
        let deadline = deadline_after(timeout);

        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        scratch.clear();
        scratch.resize(out.len(), aio_sys::IoEvent::default());

        let n = loop {
            let remaining = time_left(deadline);
            match aio_sys::io_getevents(ctx, min, &mut scratch, remaining) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {
                    if remaining == Some(Duration::ZERO) {
                        break 0;
                    }
                    continue;
                }
                Err(e) => return Err(DioError::Reactor(e)),
            }
        };

        let mut iocbs = self.iocbs();
        for (slot, raw) in out.iter_mut().zip(scratch.iter().take(n)) {
            iocbs.remove(&raw.data);
            *slot = IoEvent { id: RequestId(raw.data), res: raw.res };
        }
        Ok(n)
    }

    fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        let ctx = self.live_ctx()?;
        let mut iocbs = self.iocbs();
        let Some(cb) = iocbs.get_mut(&id.0) else {
            // Already reaped, or never accepted.
            return Ok(CancelOutcome::Refused(Errno::ENOENT));
        };
        let cb_ptr: *mut Iocb = &mut **cb;

        let mut raw = aio_sys::IoEvent::default();
        // Safety: cb_ptr was handed to io_submit() on this context and is
        // still owned by the map.
        match unsafe { aio_sys::io_cancel(ctx, cb_ptr, &mut raw) } {
            Ok(()) => {
                iocbs.remove(&id.0);
                Ok(CancelOutcome::Cancelled(IoEvent { id, res: raw.res }))
            }
            // Modern kernels report a successful cancel this way and deliver
            // the completion through the ring.
            Err(Errno::EINPROGRESS) => Ok(CancelOutcome::Pending),
            Err(e) => Ok(CancelOutcome::Refused(e)),
        }
    }

    fn inflight(&self) -> usize {
        self.iocbs().len()
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn destroy(&mut self) -> Result<()> {
        if self.ctx == 0 {
            return Ok(());
        }
        let ctx = std::mem::replace(&mut self.ctx, 0);
        // io_destroy() cancels what it can and waits for the rest, so the
        // iocbs (and the buffers they reference) are unused once it returns.
        let res = aio_sys::io_destroy(ctx).map_err(DioError::Os);
        self.iocbs().clear();
        tracing::debug!("linux-aio: context destroyed");
        res
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!(error = %e, "linux-aio: io_destroy failed");
        }
    }
}
