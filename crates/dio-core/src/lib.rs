//! # dio-core — Trait definitions for the dio engine
//!
//! This crate defines the trait boundaries and the shared vocabulary of
//! the dio direct-I/O engine. Each trait models one capability:
//!
//! | Trait            | Capability                               | Default impl (dio-module) |
//! |------------------|------------------------------------------|---------------------------|
//! | `AioBackend`     | kernel asynchronous I/O queue            | `LinuxAio`, `UringBackend` |
//! | `BufferProvider` | aligned buffers for direct I/O           | `AlignedPool`             |
//!
//! The engine (dio-engine) depends on these traits, never on concrete
//! types. Swapping a kernel queue is a type parameter change.

pub mod entry;
pub mod buffer;
pub mod backend;
pub mod config;
pub mod env;
pub mod error;

pub use backend::{deadline_after, time_left, AioBackend, BackendKind, CancelOutcome};
pub use buffer::{page_size, round_up, AlignedBuffer, BufferProvider};
pub use config::EngineConfig;
pub use entry::{IoEvent, IoOp, IoStatus, OpKind, RequestId, RequestState};
pub use error::{DioError, Result};
