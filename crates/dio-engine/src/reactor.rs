//! # Completion reactor — the single blocking wait point
//!
//! One thread at a time (the *leader*) blocks in the kernel queue's
//! `get_events()`, resolves what comes back in the request table and
//! bumps a progress generation. Everyone else waiting for a request
//! (the *followers*) sleeps on the progress condvar and re-checks the
//! table when woken.
//!
//! ```text
//!   await_one(A) ──try_lead()──▶ Leader ──get_events()──▶ resolve(A, B)
//!                                   │                          │
//!   await_one(B) ──wait_progress()◀─┴──────── bump() ◀─────────┘
//! ```
//!
//! Followers must read `generation()` *before* `try_lead()`: a leader
//! that exits between the two bumps the generation, so the follower's
//! wait returns at once instead of missing the hand-over.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use dio_core::backend::{deadline_after, AioBackend};
use dio_core::entry::{IoEvent, IoStatus, RequestId};
use dio_core::error::Result;

use crate::queue::RequestQueue;

pub struct CompletionReactor {
    /// Event scratch. Holding this lock is what makes a thread the leader.
    lead: Mutex<Vec<IoEvent>>,
    progress: Mutex<u64>,
    wake: Condvar,
}

/// Exclusive right to poll. Releasing it wakes the followers.
pub struct Leader<'a> {
    events: Option<MutexGuard<'a, Vec<IoEvent>>>,
    reactor: &'a CompletionReactor,
}

impl CompletionReactor {
    /// `max_batch`: completions retrieved per kernel call.
    pub fn new(max_batch: usize) -> Self {
        Self {
            lead: Mutex::new(vec![IoEvent::EMPTY; max_batch.max(1)]),
            progress: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Wait up to `timeout` for completions, resolve them in `queue` and
    /// return them. Blocks until any current leader has finished.
    pub fn poll<B: AioBackend>(
        &self,
        backend: &B,
        queue: &RequestQueue,
        timeout: Option<Duration>,
    ) -> Result<Vec<(RequestId, IoStatus)>> {
        let guard = self.lead.lock().unwrap_or_else(PoisonError::into_inner);
        let mut leader = Leader {
            events: Some(guard),
            reactor: self,
        };
        leader.poll(backend, queue, timeout)
    }

    /// Become the leader if nobody else is.
    pub fn try_lead(&self) -> Option<Leader<'_>> {
        let guard = match self.lead.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(Leader {
            events: Some(guard),
            reactor: self,
        })
    }

    pub fn generation(&self) -> u64 {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until the generation moves past `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_progress(&self, seen: u64, timeout: Option<Duration>) -> u64 {
        let deadline = deadline_after(timeout);
        let mut gen = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        while *gen == seen {
            gen = match deadline {
                None => self.wake.wait(gen).unwrap_or_else(PoisonError::into_inner),
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    self.wake
                        .wait_timeout(gen, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *gen
    }

    /// Announce that the request table may have changed.
    pub fn bump(&self) {
        let mut gen = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        *gen = gen.wrapping_add(1);
        drop(gen);
        self.wake.notify_all();
    }
}

impl Leader<'_> {
    /// One kernel wait plus resolution.
    ///
    /// Returns empty on timeout, and at once when nothing is in flight and
    /// `timeout` is `None`. A completion the table does not know is fatal
    /// (`UnknownRequest`); the rest of the batch is still resolved before
    /// the error is returned.
    pub fn poll<B: AioBackend>(
        &mut self,
        backend: &B,
        queue: &RequestQueue,
        timeout: Option<Duration>,
    ) -> Result<Vec<(RequestId, IoStatus)>> {
        if timeout.is_none() && queue.in_flight() == 0 {
            return Ok(Vec::new());
        }
        let Some(events) = self.events.as_mut() else {
            return Ok(Vec::new());
        };

        let n = backend.get_events(1, events, timeout)?;
        let mut done = Vec::with_capacity(n);
        let mut first_err = None;
        for ev in &events[..n] {
            let status = ev.status();
            match queue.resolve(ev.id, status) {
                Ok(()) => {
                    tracing::trace!(id = %ev.id, res = ev.res, "completion");
                    done.push((ev.id, status));
                }
                Err(e) => {
                    tracing::error!(id = %ev.id, res = ev.res, error = %e, "completion does not match a request");
                    first_err.get_or_insert(e);
                }
            }
        }
        if n > 0 {
            self.reactor.bump();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        // Unlock before waking, so a woken follower can take the lead.
        self.events.take();
        self.reactor.bump();
    }
}
