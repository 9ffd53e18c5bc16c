//! In-memory `AioBackend` with scripted behaviour, for tests that must
//! not depend on the sandbox allowing a kernel queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use dio_core::backend::{AioBackend, CancelOutcome};
use dio_core::entry::{IoEvent, IoOp, OpKind, RequestId};
use dio_core::error::{DioError, Result};
use nix::errno::Errno;

/// Byte written into read buffers by auto-completion.
pub const FILL: u8 = 0xAB;

#[derive(Default)]
struct State {
    ready: Mutex<VecDeque<IoEvent>>,
    cond: Condvar,
    ops: Mutex<HashMap<RequestId, IoOp>>,
    auto_complete: AtomicBool,
    submit_error: Mutex<Option<DioError>>,
    accept_limit: Mutex<Option<usize>>,
    wait_error: Mutex<Option<Errno>>,
    cancel_reply: Mutex<Option<CancelOutcome>>,
    wait_calls: AtomicUsize,
    destroyed: AtomicUsize,
}

/// Clones share state, so a test can keep a handle after moving the
/// backend into an engine.
#[derive(Clone)]
pub struct ScriptedBackend {
    depth: usize,
    state: Arc<State>,
}

impl ScriptedBackend {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            state: Arc::default(),
        }
    }

    fn push(&self, ev: IoEvent) {
        self.state.ready.lock().unwrap().push_back(ev);
        self.state.cond.notify_all();
    }

    /// Queue a completion with raw result `res` (negative errno on error).
    pub fn complete(&self, id: RequestId, res: i64) {
        self.state.ops.lock().unwrap().remove(&id);
        self.push(IoEvent { id, res });
    }

    /// Copy `data` into a pending read's buffer and report
    /// `reported` bytes.
    pub fn complete_with(&self, id: RequestId, data: &[u8], reported: i64) {
        if let Some(op) = self.state.ops.lock().unwrap().remove(&id) {
            let n = data.len().min(op.len);
            // Safety: the engine keeps the buffer alive while the op is
            // pending, and op.len bytes are writable.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), op.buf, n) };
        }
        self.push(IoEvent { id, res: reported });
    }

    /// Complete every submission immediately with its full length.
    pub fn set_auto_complete(&self, on: bool) {
        self.state.auto_complete.store(on, Ordering::SeqCst);
    }

    pub fn fail_next_submit(&self, err: DioError) {
        *self.state.submit_error.lock().unwrap() = Some(err);
    }

    pub fn accept_at_most(&self, n: usize) {
        *self.state.accept_limit.lock().unwrap() = Some(n);
    }

    pub fn fail_next_wait(&self, errno: Errno) {
        *self.state.wait_error.lock().unwrap() = Some(errno);
    }

    pub fn reply_to_cancel(&self, outcome: CancelOutcome) {
        *self.state.cancel_reply.lock().unwrap() = Some(outcome);
    }

    pub fn get_events_calls(&self) -> usize {
        self.state.wait_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.state.ops.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl AioBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    unsafe fn submit(&self, ops: &[IoOp]) -> Result<usize> {
        if self.destroy_calls() > 0 {
            return Err(DioError::InvalidState("kernel queue destroyed"));
        }
        if let Some(err) = self.state.submit_error.lock().unwrap().take() {
            return Err(err);
        }
        let limit = self.state.accept_limit.lock().unwrap().take().unwrap_or(usize::MAX);
        let n = ops.len().min(limit);
        if n == 0 {
            return Err(DioError::QueueFull { depth: self.depth });
        }
        let auto = self.state.auto_complete.load(Ordering::SeqCst);
        for op in &ops[..n] {
            if auto {
                if op.kind == OpKind::Read {
                    std::ptr::write_bytes(op.buf, FILL, op.len);
                }
                self.push(IoEvent { id: op.id, res: op.len as i64 });
            } else {
                self.state.ops.lock().unwrap().insert(op.id, *op);
            }
        }
        Ok(n)
    }

    fn get_events(&self, min: usize, out: &mut [IoEvent], timeout: Option<Duration>) -> Result<usize> {
        let _ = min;
        self.state.wait_calls.fetch_add(1, Ordering::SeqCst);
        if self.destroy_calls() > 0 {
            return Err(DioError::InvalidState("kernel queue destroyed"));
        }
        if let Some(errno) = self.state.wait_error.lock().unwrap().take() {
            return Err(DioError::Reactor(errno));
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut ready = self.state.ready.lock().unwrap();
        while ready.is_empty() {
            ready = match deadline {
                None => self.state.cond.wait(ready).unwrap(),
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(0);
                    }
                    self.state.cond.wait_timeout(ready, left).unwrap().0
                }
            };
        }
        let mut n = 0;
        while n < out.len() {
            let Some(ev) = ready.pop_front() else { break };
            out[n] = ev;
            n += 1;
        }
        Ok(n)
    }

    fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        if let Some(reply) = self.state.cancel_reply.lock().unwrap().take() {
            if let CancelOutcome::Cancelled(ev) = reply {
                self.state.ops.lock().unwrap().remove(&ev.id);
            }
            return Ok(reply);
        }
        if self.state.ops.lock().unwrap().contains_key(&id) {
            self.complete(id, -(Errno::ECANCELED as i64));
            Ok(CancelOutcome::Pending)
        } else {
            Ok(CancelOutcome::Refused(Errno::ENOENT))
        }
    }

    fn inflight(&self) -> usize {
        self.state.ops.lock().unwrap().len()
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn destroy(&mut self) -> Result<()> {
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
