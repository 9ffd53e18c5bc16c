//! Request table — identity assignment, completion matching, retrieval.
//!
//! Entries live in a `BTreeMap` keyed by `RequestId`. Ids are assigned
//! monotonically, so map order is submission order and `drain()` hands
//! back the oldest requests first.
//!
//! The table lock is also held while a new batch is handed to the kernel
//! (`enqueue_batch`). The reactor needs the same lock to resolve, so a
//! completion can never arrive for an id the table does not know yet.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dio_core::buffer::AlignedBuffer;
use dio_core::entry::{IoOp, IoStatus, OpKind, RequestId, RequestState};
use dio_core::error::{DioError, Result};

/// A request the caller wants queued. `len` is the transfer size; the
/// buffer must hold at least that many bytes.
pub struct NewRequest {
    pub kind: OpKind,
    pub fd: RawFd,
    pub offset: u64,
    pub len: usize,
    pub buffer: AlignedBuffer,
}

/// One tracked operation.
pub struct Request {
    id: RequestId,
    kind: OpKind,
    fd: RawFd,
    offset: u64,
    len: usize,
    buffer: AlignedBuffer,
    state: RequestState,
    status: Option<IoStatus>,
    cancel_requested: bool,
    submitted_at: Instant,
    latency: Duration,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Give up the buffer. Callers must not free it while the request is
    /// still `Submitted`.
    pub fn into_buffer(self) -> AlignedBuffer {
        self.buffer
    }
}

/// A finished request, removed from the table.
///
/// For reads the buffer's `len()` is the number of bytes read, capped at
/// the requested length. For writes the buffer comes back unchanged.
#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub kind: OpKind,
    pub fd: RawFd,
    pub offset: u64,
    /// Length asked for at submission.
    pub requested: usize,
    pub status: IoStatus,
    pub cancel_requested: bool,
    /// Submission to resolution.
    pub latency: Duration,
    buffer: AlignedBuffer,
}

impl Completion {
    pub fn bytes(&self) -> IoStatus {
        self.status
    }

    /// Data read (empty for failed reads).
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer(&self) -> &AlignedBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> AlignedBuffer {
        self.buffer
    }

    /// Fewer bytes transferred than requested (EOF for reads).
    pub fn is_short(&self) -> bool {
        matches!(self.status, Ok(n) if n < self.requested)
    }
}

/// A submission that did not make it, with the caller's buffer.
#[derive(Debug)]
pub struct Rejected {
    pub error: DioError,
    pub buffer: AlignedBuffer,
}

impl From<Rejected> for DioError {
    fn from(r: Rejected) -> Self {
        r.error
    }
}

/// Result of a batch enqueue. `accepted` keeps submission order.
#[derive(Debug, Default)]
pub struct Batch {
    pub accepted: Vec<RequestId>,
    pub rejected: Vec<Rejected>,
}

struct Inner {
    next_id: u64,
    entries: BTreeMap<RequestId, Request>,
    /// Entries in `Submitted` state.
    submitted: usize,
}

pub struct RequestQueue {
    max_depth: usize,
    inner: Mutex<Inner>,
}

impl RequestQueue {
    /// `max_depth`: how many requests may be `Submitted` at once.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: BTreeMap::new(),
                submitted: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Track one request without handing it to a kernel queue.
    pub fn enqueue(
        &self,
        kind: OpKind,
        fd: RawFd,
        offset: u64,
        len: usize,
        buffer: AlignedBuffer,
    ) -> std::result::Result<RequestId, Rejected> {
        let req = NewRequest { kind, fd, offset, len, buffer };
        self.enqueue_with(req, |ops| Ok(ops.len()))
    }

    /// Track one request and hand it to `submit` under the table lock.
    /// The buffer comes back in the rejection if `submit` fails or
    /// accepts nothing.
    pub fn enqueue_with<F>(&self, req: NewRequest, submit: F) -> std::result::Result<RequestId, Rejected>
    where
        F: FnOnce(&[IoOp]) -> Result<usize>,
    {
        let mut inner = self.lock();
        let (op, entry) = self.admit(&mut inner, req, 0, Instant::now())?;
        match submit(std::slice::from_ref(&op)) {
            Ok(n) if n > 0 => {
                inner.entries.insert(op.id, entry);
                inner.submitted += 1;
                Ok(op.id)
            }
            Ok(_) => Err(Rejected {
                error: DioError::QueueFull { depth: self.max_depth },
                buffer: entry.buffer,
            }),
            Err(error) => Err(Rejected {
                error,
                buffer: entry.buffer,
            }),
        }
    }

    /// Assign ids, build the kernel operations and hand them to `submit`
    /// under the table lock.
    ///
    /// `submit` returns how many leading ops the kernel accepted. Those
    /// are inserted as `Submitted`; the rest come back in `rejected` with
    /// their buffers. Requests beyond the free depth, or whose `len`
    /// exceeds the buffer, are rejected without reaching `submit`.
    pub fn enqueue_batch<F>(&self, requests: Vec<NewRequest>, submit: F) -> Batch
    where
        F: FnOnce(&[IoOp]) -> Result<usize>,
    {
        let mut inner = self.lock();
        let now = Instant::now();

        let mut out = Batch::default();
        let mut ops = Vec::with_capacity(requests.len());
        let mut staged = Vec::with_capacity(requests.len());

        for req in requests {
            match self.admit(&mut inner, req, staged.len(), now) {
                Ok((op, entry)) => {
                    ops.push(op);
                    staged.push(entry);
                }
                Err(rejected) => out.rejected.push(rejected),
            }
        }

        if ops.is_empty() {
            return out;
        }

        let (accepted, error) = match submit(&ops) {
            Ok(n) => (n.min(staged.len()), DioError::QueueFull { depth: self.max_depth }),
            Err(e) => (0, e),
        };

        let mut staged = staged.into_iter();
        for req in staged.by_ref().take(accepted) {
            out.accepted.push(req.id);
            inner.entries.insert(req.id, req);
        }
        inner.submitted += accepted;
        for req in staged {
            out.rejected.push(Rejected {
                error: error.clone(),
                buffer: req.buffer,
            });
        }
        out
    }

    /// Validate one request against the free depth (minus `pending`
    /// already staged) and give it an id.
    fn admit(
        &self,
        inner: &mut Inner,
        mut req: NewRequest,
        pending: usize,
        now: Instant,
    ) -> std::result::Result<(IoOp, Request), Rejected> {
        if req.len > req.buffer.capacity() {
            return Err(Rejected {
                error: DioError::InvalidState("transfer longer than buffer"),
                buffer: req.buffer,
            });
        }
        if inner.submitted + pending >= self.max_depth {
            return Err(Rejected {
                error: DioError::QueueFull { depth: self.max_depth },
                buffer: req.buffer,
            });
        }
        let id = RequestId(inner.next_id);
        inner.next_id += 1;
        // The heap block does not move when the buffer moves into the
        // table, so this pointer stays valid.
        let op = IoOp {
            id,
            kind: req.kind,
            fd: req.fd,
            offset: req.offset,
            buf: req.buffer.as_mut_ptr(),
            len: req.len,
        };
        let entry = Request {
            id,
            kind: req.kind,
            fd: req.fd,
            offset: req.offset,
            len: req.len,
            buffer: req.buffer,
            state: RequestState::Submitted,
            status: None,
            cancel_requested: false,
            submitted_at: now,
            latency: Duration::ZERO,
        };
        Ok((op, entry))
    }

    /// Record the kernel's result. Reactor only.
    ///
    /// Reads get their buffer length set to `min(bytes, requested)`.
    pub fn resolve(&self, id: RequestId, status: IoStatus) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&id).ok_or(DioError::UnknownRequest(id))?;
        if entry.state != RequestState::Submitted {
            return Err(DioError::InvalidState("request already resolved"));
        }
        if entry.kind == OpKind::Read {
            let filled = status.map_or(0, |n| n.min(entry.len));
            entry.buffer.set_len(filled)?;
        }
        entry.state = RequestState::Completed;
        entry.status = Some(status);
        entry.latency = entry.submitted_at.elapsed();
        inner.submitted -= 1;
        Ok(())
    }

    /// Remove a resolved request.
    pub fn take(&self, id: RequestId) -> Result<Completion> {
        let mut inner = self.lock();
        let entry = inner.entries.get(&id).ok_or(DioError::UnknownRequest(id))?;
        let status = match (entry.state, entry.status) {
            (RequestState::Completed, Some(status)) => status,
            _ => return Err(DioError::NotReady(id)),
        };
        let req = inner.entries.remove(&id).ok_or(DioError::UnknownRequest(id))?;
        Ok(Completion {
            id,
            kind: req.kind,
            fd: req.fd,
            offset: req.offset,
            requested: req.len,
            status,
            cancel_requested: req.cancel_requested,
            latency: req.latency,
            buffer: req.buffer,
        })
    }

    /// Current state. Ids issued earlier and no longer in the table are
    /// `Retrieved`; ids never issued are unknown.
    pub fn state(&self, id: RequestId) -> Result<RequestState> {
        let inner = self.lock();
        match inner.entries.get(&id) {
            Some(entry) => Ok(entry.state),
            None if id.0 != 0 && id.0 < inner.next_id => Ok(RequestState::Retrieved),
            None => Err(DioError::UnknownRequest(id)),
        }
    }

    /// Flag a request as cancel-requested. Returns its state.
    pub fn mark_cancel(&self, id: RequestId) -> Result<RequestState> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if entry.state == RequestState::Submitted {
                entry.cancel_requested = true;
            }
            return Ok(entry.state);
        }
        if id.0 != 0 && id.0 < inner.next_id {
            Ok(RequestState::Retrieved)
        } else {
            Err(DioError::UnknownRequest(id))
        }
    }

    /// Ids still waiting on the kernel, oldest first.
    pub fn submitted_ids(&self) -> Vec<RequestId> {
        self.lock()
            .entries
            .values()
            .filter(|r| r.state == RequestState::Submitted)
            .map(|r| r.id)
            .collect()
    }

    /// Requests in `Submitted` state.
    pub fn in_flight(&self) -> usize {
        self.lock().submitted
    }

    /// All tracked requests (submitted + completed, not yet taken).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, oldest first.
    pub fn drain(&self) -> Vec<Request> {
        let mut inner = self.lock();
        inner.submitted = 0;
        std::mem::take(&mut inner.entries).into_values().collect()
    }
}
