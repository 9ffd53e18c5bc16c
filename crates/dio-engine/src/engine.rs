//! # Engine — the facade callers talk to
//!
//! ```text
//! submit_read/submit_write ──▶ RequestQueue::enqueue_with ──▶ AioBackend::submit
//!                                      ▲                            │
//!                                      │ resolve                    ▼
//! await_one / poll ──▶ CompletionReactor ◀──── get_events ──── kernel queue
//! ```
//!
//! Generic over the kernel queue and the buffer provider, with the
//! default stack (`KernelQueue`, `AlignedPool`) filled in. Swapping a
//! component is a type parameter change plus `Engine::with_parts`.
//!
//! Buffers move: a read buffer comes from the pool and leaves with the
//! `Completion`; a write buffer moves in with `submit_write` and comes
//! back with the `Completion` (or in the `Rejected` on failure). Nobody
//! can touch a buffer while the kernel owns it.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dio_core::backend::{deadline_after, time_left, AioBackend, CancelOutcome};
use dio_core::buffer::{AlignedBuffer, BufferProvider};
use dio_core::config::EngineConfig;
use dio_core::entry::{IoOp, IoStatus, OpKind, RequestId, RequestState};
use dio_core::error::{DioError, Result};
use dio_module::{AlignedPool, KernelQueue};
use nix::errno::Errno;

use crate::queue::{Completion, NewRequest, Rejected, RequestQueue};
use crate::reactor::{CompletionReactor, Leader};

/// What `cancel()` achieved. The request must still be awaited or taken
/// in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request had already completed.
    AlreadyCompleted,
    /// The kernel accepted the cancel. The completion (usually
    /// `ECANCELED`, possibly a normal result) arrives through the reactor.
    Requested,
    /// The kernel handed the completion back directly; it is takeable now.
    Resolved,
    /// The kernel refused, typically for direct I/O already on the device.
    NotCancellable(Errno),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    /// Completions carrying an errno.
    pub failed: u64,
    pub retrieved: u64,
    pub cancel_requests: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub in_flight: usize,
    pub pool_size: usize,
    pub pool_in_use: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retrieved: AtomicU64,
    cancel_requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record_resolved(&self, status: &IoStatus) {
        Self::add(&self.completed, 1);
        if status.is_err() {
            Self::add(&self.failed, 1);
        }
    }
}

pub struct Engine<B = KernelQueue, P = AlignedPool>
where
    B: AioBackend,
    P: BufferProvider,
{
    backend: B,
    pool: P,
    queue: RequestQueue,
    reactor: CompletionReactor,
    config: EngineConfig,
    poisoned: AtomicBool,
    closed: bool,
    counters: Counters,
}

impl Engine {
    /// Engine with default settings and a kernel queue of depth
    /// `max_concurrent`. Fails with `Init(errno)` if the kernel refuses.
    pub fn init(max_concurrent: u32) -> Result<Self> {
        Self::with_config(EngineConfig::new().max_concurrent(max_concurrent))
    }

    /// Engine configured from `DIO_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::with_config(EngineConfig::from_env())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(DioError::Init(Errno::EINVAL));
        }
        config.validate()?;
        let backend = KernelQueue::open(config.backend, config.max_concurrent)?;
        let pool = AlignedPool::from_config(&config)?;
        Self::with_parts(config, backend, pool)
    }
}

impl<B, P> Engine<B, P>
where
    B: AioBackend,
    P: BufferProvider,
{
    /// Assemble an engine from an existing kernel queue and pool.
    pub fn with_parts(config: EngineConfig, backend: B, pool: P) -> Result<Self> {
        config.validate()?;
        let depth = (config.max_concurrent as usize).min(backend.depth().max(1));
        tracing::info!(
            backend = backend.name(),
            depth,
            alignment = pool.alignment(),
            max_batch = config.max_batch,
            "engine initialized"
        );
        Ok(Self {
            queue: RequestQueue::new(depth),
            reactor: CompletionReactor::new(config.max_batch),
            backend,
            pool,
            config,
            poisoned: AtomicBool::new(false),
            closed: false,
            counters: Counters::default(),
        })
    }

    // ── Submission ──

    /// Read `len` bytes at `offset` into a fresh pool buffer.
    ///
    /// Alignment of `offset` and `len` is not checked; for `O_DIRECT`
    /// descriptors the kernel reports misalignment as `EINVAL` in the
    /// completion. Zero-length reads are refused.
    pub fn submit_read(&self, fd: RawFd, offset: u64, len: usize) -> Result<RequestId> {
        self.ensure_live()?;
        if len == 0 {
            return Err(DioError::InvalidState("zero-length read"));
        }
        let buffer = self.pool.acquire(len)?;
        let req = NewRequest {
            kind: OpKind::Read,
            fd,
            offset,
            len,
            buffer,
        };
        match self.queue.enqueue_with(req, |ops| self.hand_to_kernel(ops)) {
            Ok(id) => {
                Counters::add(&self.counters.submitted, 1);
                tracing::debug!(id = %id, fd, offset, len, "read submitted");
                Ok(id)
            }
            Err(rejected) => {
                Counters::add(&self.counters.rejected, 1);
                self.recycle(rejected.buffer);
                Err(rejected.error)
            }
        }
    }

    /// Write `buffer[..buffer.len()]` at `offset`.
    ///
    /// The buffer belongs to the engine until the request is taken, and
    /// comes back inside the `Completion`. On rejection it is returned in
    /// `Rejected`. Empty buffers are refused.
    pub fn submit_write(
        &self,
        fd: RawFd,
        offset: u64,
        buffer: AlignedBuffer,
    ) -> std::result::Result<RequestId, Rejected> {
        if let Err(error) = self.ensure_live() {
            return Err(Rejected { error, buffer });
        }
        if buffer.is_empty() {
            return Err(Rejected {
                error: DioError::InvalidState("empty write buffer"),
                buffer,
            });
        }
        let len = buffer.len();
        let req = NewRequest {
            kind: OpKind::Write,
            fd,
            offset,
            len,
            buffer,
        };
        let res = self.queue.enqueue_with(req, |ops| self.hand_to_kernel(ops));
        match &res {
            Ok(id) => {
                Counters::add(&self.counters.submitted, 1);
                tracing::debug!(id = %id, fd, offset, len, "write submitted");
            }
            Err(r) => {
                Counters::add(&self.counters.rejected, 1);
                tracing::debug!(fd, offset, len, error = %r.error, "write rejected");
            }
        }
        res
    }

    /// Submit several reads in one kernel call.
    ///
    /// Returns the ids the kernel accepted, in input order. Requests it
    /// did not accept are rolled back. Fails only if nothing was accepted.
    pub fn submit_reads(&self, reads: &[(RawFd, u64, usize)]) -> Result<Vec<RequestId>> {
        self.ensure_live()?;
        if reads.iter().any(|&(_, _, len)| len == 0) {
            return Err(DioError::InvalidState("zero-length read"));
        }

        let mut requests = Vec::with_capacity(reads.len());
        for &(fd, offset, len) in reads {
            match self.pool.acquire(len) {
                Ok(buffer) => requests.push(NewRequest {
                    kind: OpKind::Read,
                    fd,
                    offset,
                    len,
                    buffer,
                }),
                Err(e) => {
                    for req in requests {
                        self.recycle(req.buffer);
                    }
                    return Err(e);
                }
            }
        }

        let batch = self
            .queue
            .enqueue_batch(requests, |ops| self.hand_to_kernel(ops));
        Counters::add(&self.counters.submitted, batch.accepted.len() as u64);
        Counters::add(&self.counters.rejected, batch.rejected.len() as u64);
        tracing::debug!(
            accepted = batch.accepted.len(),
            rejected = batch.rejected.len(),
            "read batch submitted"
        );

        let first_error = batch.rejected.first().map(|r| r.error.clone());
        for rejected in batch.rejected {
            self.recycle(rejected.buffer);
        }
        match first_error {
            Some(e) if batch.accepted.is_empty() => Err(e),
            _ => Ok(batch.accepted),
        }
    }

    /// Called under the queue lock.
    fn hand_to_kernel(&self, ops: &[IoOp]) -> Result<usize> {
        // Safety: every op points into a buffer owned by its queue entry.
        // Entries are only removed once resolved (take) or after the
        // kernel queue is destroyed (teardown), and buffers of requests
        // still in flight at teardown are leaked, never freed.
        unsafe { self.backend.submit(ops) }
    }

    // ── Completion ──

    /// Wait until `id` completes and take it.
    ///
    /// `timeout == None` waits indefinitely, as does a timeout too large
    /// to represent. Fails with `Timeout` once the deadline passes; the
    /// request stays in flight and can be awaited again.
    ///
    /// A leader's kernel wait is cut into `reactor_tick` slices, so a
    /// request resolved outside the kernel queue (a synchronous cancel)
    /// is noticed within one tick.
    pub fn await_one(&self, id: RequestId, timeout: Option<Duration>) -> Result<Completion> {
        let deadline = deadline_after(timeout);
        let tick = self.config.reactor_tick.max(Duration::from_millis(1));
        loop {
            self.ensure_live()?;
            match self.queue.state(id)? {
                RequestState::Completed => return self.take(id),
                RequestState::Retrieved => {
                    return Err(DioError::InvalidState("request already retrieved"))
                }
                RequestState::Submitted => {}
            }

            let remaining = time_left(deadline);
            if remaining == Some(Duration::ZERO) {
                return Err(DioError::Timeout);
            }

            let seen = self.reactor.generation();
            match self.reactor.try_lead() {
                Some(mut leader) => {
                    // Another leader may have resolved it since the check.
                    if self.queue.state(id)? != RequestState::Submitted {
                        continue;
                    }
                    let slice = remaining.map_or(tick, |r| r.min(tick));
                    self.drive(&mut leader, Some(slice))?;
                }
                None => {
                    self.reactor.wait_progress(seen, remaining);
                }
            }
        }
    }

    /// Retrieve completions for up to `timeout`.
    ///
    /// Returns what this call retrieved; empty on timeout. If another
    /// thread is already polling, waits for its progress instead and
    /// returns empty (what it resolved is takeable). With nothing in
    /// flight and no timeout, returns empty at once.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<(RequestId, IoStatus)>> {
        self.ensure_live()?;
        let seen = self.reactor.generation();
        match self.reactor.try_lead() {
            Some(mut leader) => self.drive(&mut leader, timeout),
            None => {
                if timeout.is_some() || self.queue.in_flight() > 0 {
                    self.reactor.wait_progress(seen, timeout);
                }
                Ok(Vec::new())
            }
        }
    }

    fn drive(&self, leader: &mut Leader<'_>, timeout: Option<Duration>) -> Result<Vec<(RequestId, IoStatus)>> {
        match leader.poll(&self.backend, &self.queue, timeout) {
            Ok(done) => {
                for (_, status) in &done {
                    self.counters.record_resolved(status);
                }
                Ok(done)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.poison(&e);
                }
                Err(e)
            }
        }
    }

    /// Take a completed request. `NotReady` while it is in flight.
    pub fn take(&self, id: RequestId) -> Result<Completion> {
        let completion = self.queue.take(id)?;
        Counters::add(&self.counters.retrieved, 1);
        if let Ok(n) = completion.status {
            let counter = match completion.kind {
                OpKind::Read => &self.counters.bytes_read,
                OpKind::Write => &self.counters.bytes_written,
            };
            Counters::add(counter, n as u64);
        }
        tracing::trace!(id = %id, status = ?completion.status, latency = ?completion.latency, "taken");
        Ok(completion)
    }

    pub fn state(&self, id: RequestId) -> Result<RequestState> {
        self.queue.state(id)
    }

    /// Advisory cancellation. See [`CancelStatus`].
    pub fn cancel(&self, id: RequestId) -> Result<CancelStatus> {
        self.ensure_live()?;
        match self.queue.mark_cancel(id)? {
            RequestState::Completed | RequestState::Retrieved => {
                return Ok(CancelStatus::AlreadyCompleted)
            }
            RequestState::Submitted => {}
        }
        Counters::add(&self.counters.cancel_requests, 1);

        let status = match self.backend.cancel(id)? {
            CancelOutcome::Cancelled(ev) => {
                let st = ev.status();
                self.queue.resolve(id, st)?;
                self.counters.record_resolved(&st);
                self.reactor.bump();
                CancelStatus::Resolved
            }
            CancelOutcome::Pending => CancelStatus::Requested,
            CancelOutcome::Refused(errno) => {
                if self.queue.state(id)? == RequestState::Submitted {
                    tracing::warn!(id = %id, %errno, "cancel refused");
                    CancelStatus::NotCancellable(errno)
                } else {
                    CancelStatus::AlreadyCompleted
                }
            }
        };
        tracing::debug!(id = %id, ?status, "cancel");
        Ok(status)
    }

    // ── Buffers ──

    /// Buffer from the engine's pool, e.g. to fill for `submit_write`.
    pub fn acquire(&self, size: usize) -> Result<AlignedBuffer> {
        self.pool.acquire(size)
    }

    /// Give a buffer (typically from a `Completion`) back to the pool.
    pub fn release(&self, buffer: AlignedBuffer) -> Result<()> {
        self.pool.release(buffer)
    }

    fn recycle(&self, buffer: AlignedBuffer) {
        if let Err(e) = self.pool.release(buffer) {
            tracing::trace!(error = %e, "buffer not returned to pool");
        }
    }

    pub fn alignment(&self) -> usize {
        self.pool.alignment()
    }

    // ── Introspection ──

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        EngineStats {
            submitted: load(&c.submitted),
            rejected: load(&c.rejected),
            completed: load(&c.completed),
            failed: load(&c.failed),
            retrieved: load(&c.retrieved),
            cancel_requests: load(&c.cancel_requests),
            bytes_read: load(&c.bytes_read),
            bytes_written: load(&c.bytes_written),
            in_flight: self.queue.in_flight(),
            pool_size: self.pool.pool_size(),
            pool_in_use: self.pool.in_use(),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(DioError::InvalidState("engine poisoned by a fatal error"));
        }
        Ok(())
    }

    fn poison(&self, cause: &DioError) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %cause, "fatal error, engine poisoned");
            self.reactor.bump();
        }
    }

    // ── Teardown ──

    /// Cancel what is still in flight, drain for up to the shutdown
    /// grace period and release the kernel queue.
    ///
    /// Returns `ResourceLeak` if requests were still in flight when
    /// called. Buffers of requests the kernel never reported back are
    /// leaked, not freed.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // ── Step 1: cancel and drain ──
        let outstanding = self.queue.in_flight();
        if outstanding > 0 {
            tracing::warn!(outstanding, "shutdown with requests in flight");
            for id in self.queue.submitted_ids() {
                match self.backend.cancel(id) {
                    Ok(CancelOutcome::Cancelled(ev)) => {
                        if let Err(e) = self.queue.resolve(id, ev.status()) {
                            tracing::warn!(id = %id, error = %e, "resolve after cancel failed");
                        }
                    }
                    Ok(CancelOutcome::Pending) => {}
                    Ok(CancelOutcome::Refused(errno)) => {
                        tracing::debug!(id = %id, %errno, "cancel refused at shutdown");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cancel failed at shutdown");
                        break;
                    }
                }
            }
            self.drain_for(self.config.shutdown_grace);
        }
        let abandoned = self.queue.in_flight();

        // ── Step 2: kernel queue ──
        let destroyed = self.backend.destroy();
        if let Err(e) = &destroyed {
            tracing::error!(error = %e, "kernel queue teardown failed");
        }

        // ── Step 3: buffers ──
        // The kernel may still write into buffers of unreported requests
        // after destroy() returns (io_uring tears down asynchronously), so
        // those are leaked, never freed.
        let mut leaked = 0usize;
        for req in self.queue.drain() {
            if req.state() == RequestState::Submitted {
                std::mem::forget(req.into_buffer());
                leaked += 1;
            } else {
                self.recycle(req.into_buffer());
            }
        }
        if leaked > 0 {
            tracing::warn!(leaked, "buffers of abandoned requests leaked");
        }

        tracing::info!(outstanding, abandoned, "engine shut down");
        if outstanding > 0 {
            return Err(DioError::ResourceLeak { outstanding, abandoned });
        }
        destroyed
    }

    fn drain_for(&self, grace: Duration) {
        let deadline = deadline_after(Some(grace));
        while self.queue.in_flight() > 0 {
            let left = time_left(deadline);
            if left == Some(Duration::ZERO) {
                break;
            }
            if let Err(e) = self.reactor.poll(&self.backend, &self.queue, left) {
                tracing::warn!(error = %e, "drain at shutdown stopped");
                break;
            }
        }
    }
}

impl<B, P> Drop for Engine<B, P>
where
    B: AioBackend,
    P: BufferProvider,
{
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            if e.is_warning() {
                tracing::warn!(error = %e, "engine dropped without shutdown");
            } else {
                tracing::error!(error = %e, "engine teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedBackend, FILL};
    use dio_core::entry::IoEvent;
    use dio_module::open_direct;
    use std::io::Write;
    use std::os::unix::io::{AsRawFd, OwnedFd};
    use std::path::Path;
    use std::sync::Arc;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn scripted(max_concurrent: u32) -> (Engine<ScriptedBackend, AlignedPool>, ScriptedBackend) {
        let backend = ScriptedBackend::new(max_concurrent as usize);
        let handle = backend.clone();
        let config = EngineConfig::new()
            .max_concurrent(max_concurrent)
            .alignment(512)
            .pool_block_size(4096)
            .shutdown_grace(Duration::from_millis(20));
        let pool = AlignedPool::from_config(&config).unwrap();
        (Engine::with_parts(config, backend, pool).unwrap(), handle)
    }

    /// O_DIRECT where the filesystem allows it, buffered otherwise
    /// (tmpfs has no direct I/O).
    fn open_for_test(path: &Path, writable: bool) -> OwnedFd {
        match open_direct(path, writable) {
            Ok(fd) => fd,
            Err(DioError::Os(Errno::EINVAL)) => std::fs::OpenOptions::new()
                .read(true)
                .write(writable)
                .open(path)
                .unwrap()
                .into(),
            Err(e) => panic!("open {}: {e}", path.display()),
        }
    }

    fn kernel_engine(config: EngineConfig) -> Option<Engine> {
        match Engine::with_config(config) {
            Ok(e) => Some(e),
            Err(e) => {
                eprintln!("skipping: kernel queue unavailable: {e}");
                None
            }
        }
    }

    // ── Scripted backend ──

    #[test]
    fn test_zero_length_read_rejected() {
        let (engine, backend) = scripted(4);
        assert!(matches!(engine.submit_read(3, 0, 0), Err(DioError::InvalidState(_))));
        assert!(matches!(
            engine.submit_reads(&[(3, 0, 512), (3, 512, 0)]),
            Err(DioError::InvalidState(_))
        ));
        assert!(backend.pending_ids().is_empty());
        assert_eq!(engine.stats().pool_in_use, 0);
    }

    #[test]
    fn test_empty_write_rejected_with_buffer() {
        let (engine, _backend) = scripted(4);
        let buf = engine.acquire(512).unwrap();
        let rejected = engine.submit_write(3, 0, buf).unwrap_err();
        assert!(matches!(rejected.error, DioError::InvalidState(_)));
        engine.release(rejected.buffer).unwrap();
    }

    #[test]
    fn test_read_completes_with_data() {
        let (engine, backend) = scripted(4);
        let id = engine.submit_read(3, 0, 512).unwrap();
        assert_eq!(engine.state(id).unwrap(), RequestState::Submitted);
        assert_eq!(engine.take(id).unwrap_err(), DioError::NotReady(id));

        backend.complete_with(id, b"FOOBARBAZ\n", 10);
        let c = engine.await_one(id, WAIT).unwrap();
        assert_eq!(c.status, Ok(10));
        assert_eq!(c.data(), b"FOOBARBAZ\n");
        assert!(c.is_short());
        assert_eq!(engine.state(id).unwrap(), RequestState::Retrieved);
        engine.release(c.into_buffer()).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retrieved, 1);
        assert_eq!(stats.bytes_read, 10);
        assert_eq!(stats.pool_in_use, 0);
    }

    #[test]
    fn test_overreported_read_is_clamped() {
        let (engine, backend) = scripted(4);
        let id = engine.submit_read(3, 0, 100).unwrap();
        backend.complete_with(id, &[1u8; 100], 4096);
        let c = engine.await_one(id, WAIT).unwrap();
        assert_eq!(c.data().len(), 100);
    }

    #[test]
    fn test_write_returns_buffer() {
        let (engine, backend) = scripted(4);
        let mut buf = engine.acquire(512).unwrap();
        buf.copy_from(&[9u8; 512]).unwrap();
        let id = engine.submit_write(3, 4096, buf).unwrap();
        backend.complete(id, 512);
        let c = engine.await_one(id, WAIT).unwrap();
        assert_eq!(c.kind, OpKind::Write);
        assert_eq!(c.offset, 4096);
        assert_eq!(c.data(), &[9u8; 512][..]);
        assert_eq!(engine.stats().bytes_written, 512);
    }

    #[test]
    fn test_queue_full_recycles_buffer() {
        let (engine, _backend) = scripted(1);
        engine.submit_read(3, 0, 512).unwrap();
        assert_eq!(
            engine.submit_read(3, 512, 512).unwrap_err(),
            DioError::QueueFull { depth: 1 }
        );
        assert_eq!(engine.stats().pool_in_use, 1);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[test]
    fn test_kernel_rejection_rolls_back() {
        let (engine, backend) = scripted(4);
        backend.fail_next_submit(DioError::Submit(Errno::EBADF));
        assert_eq!(
            engine.submit_read(-1, 0, 512).unwrap_err(),
            DioError::Submit(Errno::EBADF)
        );
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().pool_in_use, 0);

        backend.fail_next_submit(DioError::Submit(Errno::EBADF));
        let data = AlignedBuffer::from_slice(&[1u8; 512], 512).unwrap();
        let rejected = engine.submit_write(-1, 0, data).unwrap_err();
        assert_eq!(rejected.error, DioError::Submit(Errno::EBADF));
        assert_eq!(rejected.buffer.as_slice(), &[1u8; 512][..]);
    }

    #[test]
    fn test_batch_partial_acceptance() {
        let (engine, backend) = scripted(8);
        backend.accept_at_most(2);
        let ids = engine
            .submit_reads(&[(3, 0, 512), (3, 512, 512), (3, 1024, 512)])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(backend.pending_ids(), ids);
        assert_eq!(engine.in_flight(), 2);
        assert_eq!(engine.stats().pool_in_use, 2);
    }

    #[test]
    fn test_await_timeout_keeps_request() {
        let (engine, backend) = scripted(2);
        let id = engine.submit_read(3, 0, 512).unwrap();
        assert_eq!(
            engine.await_one(id, Some(Duration::from_millis(10))).unwrap_err(),
            DioError::Timeout
        );
        assert_eq!(engine.state(id).unwrap(), RequestState::Submitted);
        backend.complete(id, 512);
        engine.await_one(id, WAIT).unwrap();
    }

    #[test]
    fn test_poll_returns_batch() {
        let (engine, backend) = scripted(4);
        let a = engine.submit_read(3, 0, 512).unwrap();
        let b = engine.submit_read(3, 512, 512).unwrap();
        backend.complete(a, 512);
        backend.complete(b, -(Errno::EIO as i64));
        let done = engine.poll(WAIT).unwrap();
        assert_eq!(done, vec![(a, Ok(512)), (b, Err(Errno::EIO))]);
        assert!(engine.poll(None).unwrap().is_empty());
        assert_eq!(engine.stats().failed, 1);
        assert_eq!(engine.take(b).unwrap().bytes(), Err(Errno::EIO));
    }

    #[test]
    fn test_unrepresentable_timeout_is_unbounded() {
        let (engine, backend) = scripted(4);
        let a = engine.submit_read(3, 0, 512).unwrap();
        backend.complete(a, 512);
        assert_eq!(engine.await_one(a, Some(Duration::MAX)).unwrap().status, Ok(512));

        let b = engine.submit_read(3, 512, 512).unwrap();
        backend.complete(b, 512);
        assert_eq!(engine.poll(Some(Duration::MAX)).unwrap(), vec![(b, Ok(512))]);
        assert!(!engine.is_poisoned());
    }

    #[test]
    fn test_sync_cancel_wakes_blocked_leader() {
        let (engine, backend) = scripted(4);
        let engine = Arc::new(engine);
        let id = engine.submit_read(3, 0, 512).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let res = engine.await_one(id, None).map(|c| c.status);
                tx.send(res).unwrap();
            })
        };
        // Let the waiter become leader and block in the kernel wait.
        std::thread::sleep(Duration::from_millis(30));

        backend.reply_to_cancel(CancelOutcome::Cancelled(IoEvent {
            id,
            res: -(Errno::ECANCELED as i64),
        }));
        assert_eq!(engine.cancel(id).unwrap(), CancelStatus::Resolved);

        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(res, Ok(Err(Errno::ECANCELED)));
        waiter.join().unwrap();
    }

    #[test]
    fn test_unknown_completion_poisons() {
        let (engine, backend) = scripted(2);
        let id = engine.submit_read(3, 0, 512).unwrap();
        backend.complete(RequestId(777), 512);
        assert_eq!(
            engine.await_one(id, WAIT).unwrap_err(),
            DioError::UnknownRequest(RequestId(777))
        );
        assert!(engine.is_poisoned());
        assert!(matches!(engine.submit_read(3, 0, 512), Err(DioError::InvalidState(_))));
        assert!(matches!(engine.poll(Some(Duration::ZERO)), Err(DioError::InvalidState(_))));
    }

    #[test]
    fn test_reactor_failure_poisons() {
        let (engine, backend) = scripted(2);
        engine.submit_read(3, 0, 512).unwrap();
        backend.fail_next_wait(Errno::EFAULT);
        assert_eq!(
            engine.poll(Some(Duration::ZERO)).unwrap_err(),
            DioError::Reactor(Errno::EFAULT)
        );
        assert!(engine.is_poisoned());
    }

    #[test]
    fn test_cancel_outcomes() {
        let (engine, backend) = scripted(8);

        // Kernel accepts; completion arrives as ECANCELED.
        let a = engine.submit_read(3, 0, 512).unwrap();
        assert_eq!(engine.cancel(a).unwrap(), CancelStatus::Requested);
        let c = engine.await_one(a, WAIT).unwrap();
        assert_eq!(c.status, Err(Errno::ECANCELED));
        assert!(c.cancel_requested);
        assert!(c.data().is_empty());

        // Kernel hands the completion back directly.
        let b = engine.submit_read(3, 0, 512).unwrap();
        backend.reply_to_cancel(CancelOutcome::Cancelled(IoEvent {
            id: b,
            res: -(Errno::ECANCELED as i64),
        }));
        assert_eq!(engine.cancel(b).unwrap(), CancelStatus::Resolved);
        assert_eq!(engine.take(b).unwrap().status, Err(Errno::ECANCELED));

        // Kernel refuses; the request still completes normally.
        let c_id = engine.submit_read(3, 0, 512).unwrap();
        backend.reply_to_cancel(CancelOutcome::Refused(Errno::EINVAL));
        assert_eq!(
            engine.cancel(c_id).unwrap(),
            CancelStatus::NotCancellable(Errno::EINVAL)
        );
        backend.complete(c_id, 512);
        assert_eq!(engine.await_one(c_id, WAIT).unwrap().status, Ok(512));

        // Already done.
        let d = engine.submit_read(3, 0, 512).unwrap();
        backend.complete(d, 512);
        engine.poll(WAIT).unwrap();
        assert_eq!(engine.cancel(d).unwrap(), CancelStatus::AlreadyCompleted);
        engine.take(d).unwrap();
        assert_eq!(engine.cancel(d).unwrap(), CancelStatus::AlreadyCompleted);

        assert_eq!(
            engine.cancel(RequestId(10_000)).unwrap_err(),
            DioError::UnknownRequest(RequestId(10_000))
        );
        assert_eq!(engine.stats().cancel_requests, 3);
    }

    #[test]
    fn test_shutdown_with_submitted_request_leaks() {
        let (engine, backend) = scripted(2);
        let id = engine.submit_read(3, 0, 512).unwrap();
        // Script a refusal so the request stays in flight past the grace.
        backend.reply_to_cancel(CancelOutcome::Refused(Errno::EINVAL));
        assert_eq!(
            engine.shutdown().unwrap_err(),
            DioError::ResourceLeak { outstanding: 1, abandoned: 1 }
        );
        assert_eq!(backend.destroy_calls(), 1);
        assert_eq!(backend.pending_ids(), vec![id]);
    }

    #[test]
    fn test_shutdown_cancels_and_drains() {
        let (engine, backend) = scripted(2);
        engine.submit_read(3, 0, 512).unwrap();
        // Default scripted cancel completes the request with ECANCELED.
        assert_eq!(
            engine.shutdown().unwrap_err(),
            DioError::ResourceLeak { outstanding: 1, abandoned: 0 }
        );
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[test]
    fn test_clean_shutdown_and_drop() {
        let (engine, backend) = scripted(2);
        let id = engine.submit_read(3, 0, 512).unwrap();
        backend.complete(id, 512);
        engine.poll(WAIT).unwrap();
        // Completed but never taken: not outstanding.
        engine.shutdown().unwrap();
        assert_eq!(backend.destroy_calls(), 1);

        let (engine, backend) = scripted(2);
        drop(engine);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[test]
    fn test_concurrent_submit_and_await() {
        let (engine, backend) = scripted(64);
        backend.set_auto_complete(true);
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..50u64 {
                        let id = engine.submit_read(3, (t * 50 + i) * 512, 512).unwrap();
                        let c = engine.await_one(id, WAIT).unwrap();
                        assert_eq!(c.id, id);
                        assert_eq!(c.data(), &[FILL; 512][..]);
                        engine.release(c.into_buffer()).unwrap();
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().pool_in_use, 0);
    }

    // ── Kernel queue ──

    #[test]
    fn test_init_zero_depth() {
        assert_eq!(Engine::init(0).err(), Some(DioError::Init(Errno::EINVAL)));
    }

    /// Write 4096 lines of "FOOBARBAZ\n", reopen for direct reads, read
    /// the first page through a depth-1 queue.
    #[test]
    fn test_foobarbaz_first_page() {
        let Some(engine) = kernel_engine(EngineConfig::new().max_concurrent(1)) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foobarbaz");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            for _ in 0..4096 {
                f.write_all(b"FOOBARBAZ\n").unwrap();
            }
            f.sync_all().unwrap();
        }

        let fd = open_for_test(&path, false);
        let page = engine.alignment();
        let id = engine.submit_read(fd.as_raw_fd(), 0, page).unwrap();
        let c = engine.await_one(id, None).unwrap();
        // 40960-byte file: a full page unless pages are larger than that.
        let want = page.min(4096 * 10);
        assert_eq!(c.status, Ok(want));
        assert_eq!(c.data().len(), want);
        let expected: Vec<u8> = b"FOOBARBAZ\n".iter().copied().cycle().take(want).collect();
        assert_eq!(c.data(), &expected[..]);
        engine.release(c.into_buffer()).unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_write_read_roundtrip() {
        for kind in [dio_core::BackendKind::LinuxAio, dio_core::BackendKind::Uring] {
            let Some(engine) = kernel_engine(EngineConfig::new().max_concurrent(4).backend(kind)) else {
                continue;
            };
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("roundtrip");
            std::fs::File::create(&path).unwrap();
            let fd = open_for_test(&path, true);
            let page = engine.alignment();

            let pattern: Vec<u8> = (0..page * 2).map(|i| (i % 251) as u8).collect();
            let mut buf = engine.acquire(pattern.len()).unwrap();
            buf.copy_from(&pattern).unwrap();
            let w = engine.submit_write(fd.as_raw_fd(), 0, buf).unwrap();
            let wc = engine.await_one(w, WAIT).unwrap();
            assert_eq!(wc.status, Ok(pattern.len()), "{kind}");
            engine.release(wc.into_buffer()).unwrap();

            let r = engine.submit_read(fd.as_raw_fd(), 0, pattern.len()).unwrap();
            let rc = engine.await_one(r, WAIT).unwrap();
            assert_eq!(rc.data(), &pattern[..], "{kind}");
            engine.release(rc.into_buffer()).unwrap();
            engine.shutdown().unwrap();
        }
    }

    #[test]
    fn test_short_read_at_eof() {
        let Some(engine) = kernel_engine(EngineConfig::new().max_concurrent(2)) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [b'x'; 100]).unwrap();
        let fd = open_for_test(&path, false);
        let page = engine.alignment();

        let id = engine.submit_read(fd.as_raw_fd(), 0, page).unwrap();
        let c = engine.await_one(id, WAIT).unwrap();
        assert_eq!(c.status, Ok(100));
        assert!(c.data().len() <= page);
        assert_eq!(c.data(), &[b'x'; 100][..]);
    }

    #[test]
    fn test_batch_reads_kernel() {
        let Some(engine) = kernel_engine(EngineConfig::new().max_concurrent(8)) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch");
        let page = engine.alignment();
        let content: Vec<u8> = (0..page * 4).map(|i| (i / page) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        let fd = open_for_test(&path, false);

        let reads: Vec<_> = (0..4).map(|i| (fd.as_raw_fd(), (i * page) as u64, page)).collect();
        let ids = engine.submit_reads(&reads).unwrap();
        assert_eq!(ids.len(), 4);
        for (i, id) in ids.into_iter().enumerate() {
            let c = engine.await_one(id, WAIT).unwrap();
            assert!(c.data().iter().all(|&b| b == i as u8));
        }
    }
}
