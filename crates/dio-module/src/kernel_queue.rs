//! `KernelQueue` — runtime choice between the kernel queue backends.

use std::time::Duration;

use dio_core::backend::{AioBackend, BackendKind, CancelOutcome};
use dio_core::entry::{IoEvent, IoOp, RequestId};
use dio_core::error::Result;

use crate::linux_aio::LinuxAio;
use crate::uring::UringBackend;

/// Either backend, picked from `BackendKind` when the engine starts.
pub enum KernelQueue {
    Aio(LinuxAio),
    Uring(UringBackend),
}

impl KernelQueue {
    pub fn open(kind: BackendKind, depth: u32) -> Result<Self> {
        match kind {
            BackendKind::LinuxAio => LinuxAio::new(depth).map(Self::Aio),
            BackendKind::Uring => UringBackend::new(depth).map(Self::Uring),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Aio(_) => BackendKind::LinuxAio,
            Self::Uring(_) => BackendKind::Uring,
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $q:ident => $e:expr) => {
        match $self {
            KernelQueue::Aio($q) => $e,
            KernelQueue::Uring($q) => $e,
        }
    };
}

impl AioBackend for KernelQueue {
    fn name(&self) -> &'static str {
        dispatch!(self, q => q.name())
    }

    unsafe fn submit(&self, ops: &[IoOp]) -> Result<usize> {
        dispatch!(self, q => q.submit(ops))
    }

    fn get_events(&self, min: usize, out: &mut [IoEvent], timeout: Option<Duration>) -> Result<usize> {
        dispatch!(self, q => q.get_events(min, out, timeout))
    }

    fn cancel(&self, id: RequestId) -> Result<CancelOutcome> {
        dispatch!(self, q => q.cancel(id))
    }

    fn inflight(&self) -> usize {
        dispatch!(self, q => q.inflight())
    }

    fn depth(&self) -> usize {
        dispatch!(self, q => q.depth())
    }

    fn destroy(&mut self) -> Result<()> {
        dispatch!(self, q => q.destroy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_reports_kind() {
        for kind in [BackendKind::LinuxAio, BackendKind::Uring] {
            match KernelQueue::open(kind, 4) {
                Ok(mut q) => {
                    assert_eq!(q.kind(), kind);
                    assert_eq!(q.depth(), 4);
                    assert_eq!(q.inflight(), 0);
                    q.destroy().unwrap();
                }
                Err(e) => eprintln!("skipping {kind}: {e}"),
            }
        }
    }
}
