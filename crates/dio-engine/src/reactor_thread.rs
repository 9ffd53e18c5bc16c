//! # Reactor thread — polling on a dedicated OS thread
//!
//! For callers that prefer to be told about completions instead of
//! awaiting them. The thread:
//! 1. Polls the engine with the configured tick as timeout
//! 2. Pushes every `(id, status)` it retrieved into a bounded lock-free
//!    channel
//! 3. Exits on `stop()`/drop, or after a fatal engine error
//!
//! Only completions the thread itself retrieved go through the channel.
//! Requests resolved by a concurrent `await_one()` leader are takeable as
//! usual but are not announced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use dio_core::backend::AioBackend;
use dio_core::buffer::BufferProvider;
use dio_core::entry::{IoStatus, RequestId};
use dio_core::error::{DioError, Result};
use dio_module::{AlignedPool, KernelQueue};
use nix::errno::Errno;

use crate::engine::Engine;

struct Shared {
    ready: ArrayQueue<(RequestId, IoStatus)>,
    stop: AtomicBool,
}

pub struct ReactorThread<B = KernelQueue, P = AlignedPool>
where
    B: AioBackend + 'static,
    P: BufferProvider + 'static,
{
    engine: Arc<Engine<B, P>>,
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<Result<()>>>,
}

impl<B, P> ReactorThread<B, P>
where
    B: AioBackend + 'static,
    P: BufferProvider + 'static,
{
    /// Start polling `engine` on a thread named `dio-reactor`.
    pub fn spawn(engine: Arc<Engine<B, P>>) -> Result<Self> {
        let shared = Arc::new(Shared {
            ready: ArrayQueue::new(engine.config().completion_channel.max(1)),
            stop: AtomicBool::new(false),
        });
        let tick = engine.config().reactor_tick;

        let thread_engine = Arc::clone(&engine);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("dio-reactor".into())
            .spawn(move || reactor_loop(thread_engine, thread_shared, tick))
            .map_err(|e| DioError::Os(e.raw_os_error().map_or(Errno::EAGAIN, Errno::from_raw)))?;

        Ok(Self {
            engine,
            shared,
            handle: Some(handle),
        })
    }

    /// Next completion announced by the thread, if any.
    pub fn try_next(&self) -> Option<(RequestId, IoStatus)> {
        self.shared.ready.pop()
    }

    pub fn engine(&self) -> &Arc<Engine<B, P>> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and report how it ended.
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DioError::InvalidState("reactor thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl<B, P> Drop for ReactorThread<B, P>
where
    B: AioBackend + 'static,
    P: BufferProvider + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            tracing::error!(error = %e, "reactor thread ended with error");
        }
    }
}

/// Runs on the dedicated thread.
fn reactor_loop<B, P>(engine: Arc<Engine<B, P>>, shared: Arc<Shared>, tick: Duration) -> Result<()>
where
    B: AioBackend,
    P: BufferProvider,
{
    tracing::debug!(?tick, "reactor thread started");
    let backoff = tick.min(Duration::from_millis(1));

    while !shared.stop.load(Ordering::Acquire) {
        let done = match engine.poll(Some(tick)) {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "reactor thread stopping");
                return Err(e);
            }
        };
        for item in done {
            let mut item = item;
            // Channel full: wait for the consumer rather than drop.
            while let Err(back) = shared.ready.push(item) {
                if shared.stop.load(Ordering::Acquire) {
                    return Ok(());
                }
                item = back;
                thread::sleep(backoff);
            }
        }
    }

    tracing::debug!("reactor thread stopped");
    Ok(())
}
