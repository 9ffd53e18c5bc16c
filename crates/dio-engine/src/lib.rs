//! # dio-engine — Asynchronous direct-I/O request engine
//!
//! Submits reads and writes against `O_DIRECT` file descriptors to a
//! kernel asynchronous I/O queue and hands the results back by request id.
//!
//! | Component           | Role                                          |
//! |---------------------|-----------------------------------------------|
//! | `RequestQueue`      | id allocation, request table, lifecycle       |
//! | `CompletionReactor` | single-poller wait, resolves completions      |
//! | `Engine`            | facade: submit, await, poll, cancel, shutdown |
//! | `ReactorThread`     | optional dedicated polling thread             |
//!
//! ```no_run
//! use dio_engine::{open_direct, Engine};
//!
//! let engine = Engine::init(32)?;
//! let fd = open_direct("/var/tmp/data.bin", false)?;
//! # use std::os::unix::io::AsRawFd;
//! let id = engine.submit_read(fd.as_raw_fd(), 0, 4096)?;
//! let done = engine.await_one(id, None)?;
//! println!("read {:?} bytes", done.status);
//! engine.release(done.into_buffer())?;
//! engine.shutdown()?;
//! # Ok::<(), dio_engine::DioError>(())
//! ```

pub mod queue;
pub mod reactor;
pub mod engine;
pub mod reactor_thread;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{CancelStatus, Engine, EngineStats};
pub use queue::{Batch, Completion, NewRequest, Rejected, RequestQueue};
pub use reactor::CompletionReactor;
pub use reactor_thread::ReactorThread;

pub use dio_core::{
    AioBackend, AlignedBuffer, BackendKind, BufferProvider, CancelOutcome, DioError, EngineConfig,
    IoStatus, OpKind, RequestId, RequestState, Result,
};
pub use dio_module::{open_direct, AlignedPool, KernelQueue};
