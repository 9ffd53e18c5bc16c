//! `UringBackend` — io_uring implementation of `AioBackend`.
//!
//! Uses the `io-uring` crate: SQEs are pushed through the shared
//! submission queue, `io_uring_enter()` flushes them, CQEs are drained
//! from the shared completion queue. No SQPOLL, no fixed files, no
//! registered buffers.
//!
//! Timed waits need `IORING_FEAT_EXT_ARG` (5.11+). Older kernels fall
//! back to a short sleep/drain loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dio_core::backend::{deadline_after, time_left, AioBackend, CancelOutcome};
use dio_core::entry::{IoEvent, IoOp, OpKind, RequestId};
use dio_core::error::{DioError, Result};
use io_uring::{opcode, squeue, types, IoUring};
use nix::errno::Errno;

/// user_data of our own AsyncCancel SQEs. Their CQEs are swallowed.
const CANCEL_TAG: u64 = u64::MAX - 1;

/// Sleep between drains when the kernel cannot do timed waits.
const FALLBACK_NAP: Duration = Duration::from_micros(200);

pub struct UringBackend {
    /// `None` once destroyed.
    ring: Option<IoUring>,
    depth: usize,
    ext_arg: bool,
    /// Serializes SQ producers.
    sq_lock: Mutex<()>,
    /// Serializes CQ consumers.
    cq_lock: Mutex<()>,
    inflight: AtomicUsize,
}

fn errno_of(e: &std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

impl UringBackend {
    /// Create a ring with at least `depth` SQ entries (rounded up to a
    /// power of two by the kernel).
    pub fn new(depth: u32) -> Result<Self> {
        if depth == 0 {
            return Err(DioError::Init(Errno::EINVAL));
        }
        let ring = IoUring::builder()
            .build(depth)
            .map_err(|e| DioError::Init(errno_of(&e)))?;
        let ext_arg = ring.params().is_feature_ext_arg();
        tracing::debug!(
            depth,
            sq_entries = ring.params().sq_entries(),
            ext_arg,
            "io_uring: ring created"
        );
        Ok(Self {
            ring: Some(ring),
            depth: depth as usize,
            ext_arg,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            inflight: AtomicUsize::new(0),
        })
    }

    fn ring(&self) -> Result<&IoUring> {
        self.ring
            .as_ref()
            .ok_or(DioError::InvalidState("kernel queue destroyed"))
    }

    fn build_sqe(op: &IoOp) -> Result<squeue::Entry> {
        let len = u32::try_from(op.len)
            .map_err(|_| DioError::InvalidState("transfer larger than 4 GiB"))?;
        let fd = types::Fd(op.fd);
        let sqe = match op.kind {
            OpKind::Read => opcode::Read::new(fd, op.buf, len).offset(op.offset).build(),
            OpKind::Write => opcode::Write::new(fd, op.buf as *const u8, len)
                .offset(op.offset)
                .build(),
        };
        Ok(sqe.user_data(op.id.0))
    }

    /// Flush pushed SQEs. Transient refusals leave them queued for the
    /// next `io_uring_enter()`.
    fn flush(&self, ring: &IoUring) -> Result<()> {
        match ring.submit() {
            Ok(_) => Ok(()),
            Err(e) => match errno_of(&e) {
                Errno::EBUSY | Errno::EAGAIN | Errno::EINTR => {
                    tracing::debug!(error = %e, "io_uring: submit deferred");
                    Ok(())
                }
                other => Err(DioError::Reactor(other)),
            },
        }
    }

    /// Move ready CQEs into `out`. Returns the number written.
    fn drain(&self, ring: &IoUring, out: &mut [IoEvent]) -> usize {
        let _cq = self.cq_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Safety: cq_lock makes us the only consumer.
        let mut cq = unsafe { ring.completion_shared() };
        let mut n = 0;
        while n < out.len() {
            let Some(cqe) = cq.next() else { break };
            if cqe.user_data() == CANCEL_TAG {
                if cqe.result() < 0 {
                    tracing::trace!(res = cqe.result(), "io_uring: cancel sqe completed");
                }
                continue;
            }
            out[n] = IoEvent {
                id: RequestId(cqe.user_data()),
                res: cqe.result() as i64,
            };
            n += 1;
        }
        if n > 0 {
            self.inflight.fetch_sub(n, Ordering::AcqRel);
        }
        n
    }

    /// Block in `io_uring_enter()` until `min` CQEs are ready.
    /// Returns false on timeout.
    fn wait(&self, ring: &IoUring, min: usize, timeout: Option<Duration>) -> Result<bool> {
        let submitter = ring.submitter();
        let res = match timeout {
            None => submitter.submit_and_wait(min),
            Some(d) => {
                let ts = types::Timespec::from(d);
                let args = types::SubmitArgs::new().timespec(&ts);
                submitter.submit_with_args(min, &args)
            }
        };
        match res {
            Ok(_) => Ok(true),
            Err(e) => match errno_of(&e) {
                Errno::ETIME => Ok(false),
                Errno::EINTR | Errno::EBUSY | Errno::EAGAIN => Ok(true),
                other => Err(DioError::Reactor(other)),
            },
        }
    }
}

impl AioBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    unsafe fn submit(&self, ops: &[IoOp]) -> Result<usize> {
        let ring = self.ring()?;
        if ops.is_empty() {
            return Ok(0);
        }

        let sqes = ops.iter().map(Self::build_sqe).collect::<Result<Vec<_>>>()?;

        let _sq = self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pushed = 0;
        {
            // Safety: sq_lock makes us the only producer.
            let mut sq = ring.submission_shared();
            for sqe in &sqes {
                if sq.push(sqe).is_err() {
                    break;
                }
                pushed += 1;
            }
            sq.sync();
        }
        if pushed == 0 {
            return Err(DioError::QueueFull { depth: self.depth });
        }
        self.inflight.fetch_add(pushed, Ordering::AcqRel);
        // Pushed SQEs are visible to the kernel, so they count as accepted
        // even if this enter fails. A broken ring surfaces in get_events().
        if let Err(e) = self.flush(ring) {
            tracing::error!(error = %e, "io_uring: submit failed after push");
        }
        Ok(pushed)
    }

    fn get_events(&self, min: usize, out: &mut [IoEvent], timeout: Option<Duration>) -> Result<usize> {
        let ring = self.ring()?;
        if out.is_empty() {
            return Ok(0);
        }
        let want = min.clamp(1, out.len());
        let deadline = deadline_after(timeout);
        let mut got = 0;

        loop {
            got += self.drain(ring, &mut out[got..]);
            if got >= want || min == 0 {
                return Ok(got);
            }
            let remaining = time_left(deadline);
            if remaining == Some(Duration::ZERO) {
                return Ok(got);
            }

            if self.ext_arg || remaining.is_none() {
                if !self.wait(ring, want - got, remaining)? {
                    return Ok(got + self.drain(ring, &mut out[got..]));
                }
            } else {
                self.flush(ring)?;
                std::thread::sleep(remaining.map_or(FALLBACK_NAP, |r| r.min(FALLBACK_NAP)));
            }
        }
    }

    fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        let ring = self.ring()?;
        let sqe = opcode::AsyncCancel::new(id.0).build().user_data(CANCEL_TAG);
        {
            let _sq = self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner);
            // Safety: AsyncCancel references no user memory; sq_lock makes
            // us the only producer.
            let pushed = unsafe {
                let mut sq = ring.submission_shared();
                let ok = sq.push(&sqe).is_ok();
                sq.sync();
                ok
            };
            if !pushed {
                return Ok(CancelOutcome::Refused(Errno::EAGAIN));
            }
        }
        self.flush(ring)?;
        Ok(CancelOutcome::Pending)
    }

    fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(ring) = self.ring.take() {
            // Closing the ring fd does not wait: the kernel cancels and
            // reaps outstanding requests asynchronously, and may still write
            // into their buffers afterwards. Callers must not free buffers
            // of requests that were never reported complete.
            drop(ring);
            self.inflight.store(0, Ordering::Release);
            tracing::debug!("io_uring: ring destroyed");
        }
        Ok(())
    }
}
