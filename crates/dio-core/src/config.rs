//! Engine configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder setters called by the embedding code
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults (`new()`)
//!
//! # Example
//!
//! ```rust,ignore
//! use dio_core::config::EngineConfig;
//!
//! let config = EngineConfig::from_env()
//!     .max_concurrent(64)
//!     .backend(BackendKind::Uring);
//! ```

use std::time::Duration;

use crate::backend::BackendKind;
use crate::buffer::page_size;
use crate::env::{env_get, env_get_ms};
use crate::error::{DioError, Result};

pub mod defaults {
    /// Kernel queue depth.
    pub const MAX_CONCURRENT: u32 = 128;
    /// Completions retrieved per reactor poll.
    pub const MAX_BATCH: usize = 64;
    /// Standard pool block size in bytes (0 = one page).
    pub const POOL_BLOCK_SIZE: usize = 0;
    /// Free-list capacity of the pool (0 = same as queue depth).
    pub const POOL_CAPACITY: usize = 0;
    /// Blocks allocated at init.
    pub const POOL_PREALLOC: usize = 0;
    /// How long shutdown waits for in-flight requests.
    pub const SHUTDOWN_GRACE_MS: u64 = 500;
    /// Poll timeout of the dedicated reactor thread.
    pub const REACTOR_TICK_MS: u64 = 10;
    /// Capacity of the reactor thread's completion channel.
    pub const COMPLETION_CHANNEL: usize = 1024;
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneous kernel operations (kernel queue depth).
    pub max_concurrent: u32,
    /// Buffer alignment boundary in bytes (power of two).
    pub alignment: usize,
    /// Maximum completions retrieved per poll.
    pub max_batch: usize,
    /// Kernel queue implementation.
    pub backend: BackendKind,
    /// Pool block size; requests up to this size are recycled.
    pub pool_block_size: usize,
    /// Maximum free blocks kept by the pool.
    pub pool_capacity: usize,
    /// Blocks allocated up front.
    pub pool_prealloc: usize,
    /// Shutdown drain window for in-flight requests.
    pub shutdown_grace: Duration,
    /// Reactor thread poll timeout.
    pub reactor_tick: Duration,
    /// Reactor thread completion channel capacity.
    pub completion_channel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        let page = page_size();
        Self {
            max_concurrent: defaults::MAX_CONCURRENT,
            alignment: page,
            max_batch: defaults::MAX_BATCH,
            backend: BackendKind::default(),
            pool_block_size: if defaults::POOL_BLOCK_SIZE == 0 { page } else { defaults::POOL_BLOCK_SIZE },
            pool_capacity: defaults::POOL_CAPACITY,
            pool_prealloc: defaults::POOL_PREALLOC,
            shutdown_grace: Duration::from_millis(defaults::SHUTDOWN_GRACE_MS),
            reactor_tick: Duration::from_millis(defaults::REACTOR_TICK_MS),
            completion_channel: defaults::COMPLETION_CHANNEL,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `DIO_MAX_CONCURRENT` - Kernel queue depth
    /// - `DIO_ALIGNMENT` - Buffer alignment in bytes
    /// - `DIO_MAX_BATCH` - Completions per poll
    /// - `DIO_BACKEND` - `aio` or `uring`
    /// - `DIO_POOL_BLOCK_SIZE` - Pool block size in bytes
    /// - `DIO_POOL_CAPACITY` - Pool free-list capacity
    /// - `DIO_POOL_PREALLOC` - Blocks allocated at init
    /// - `DIO_SHUTDOWN_GRACE_MS` - Shutdown drain window
    /// - `DIO_REACTOR_TICK_MS` - Reactor thread poll timeout
    /// - `DIO_COMPLETION_CHANNEL` - Reactor thread channel capacity
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            max_concurrent: env_get("DIO_MAX_CONCURRENT", base.max_concurrent),
            alignment: env_get("DIO_ALIGNMENT", base.alignment),
            max_batch: env_get("DIO_MAX_BATCH", base.max_batch),
            backend: env_get("DIO_BACKEND", base.backend),
            pool_block_size: env_get("DIO_POOL_BLOCK_SIZE", base.pool_block_size),
            pool_capacity: env_get("DIO_POOL_CAPACITY", base.pool_capacity),
            pool_prealloc: env_get("DIO_POOL_PREALLOC", base.pool_prealloc),
            shutdown_grace: env_get_ms("DIO_SHUTDOWN_GRACE_MS", base.shutdown_grace),
            reactor_tick: env_get_ms("DIO_REACTOR_TICK_MS", base.reactor_tick),
            completion_channel: env_get("DIO_COMPLETION_CHANNEL", base.completion_channel),
        }
    }

    // ── Builder setters ──

    pub fn max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn alignment(mut self, bytes: usize) -> Self {
        self.alignment = bytes;
        self
    }

    pub fn max_batch(mut self, n: usize) -> Self {
        self.max_batch = n;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    pub fn pool_block_size(mut self, bytes: usize) -> Self {
        self.pool_block_size = bytes;
        self
    }

    pub fn pool_capacity(mut self, n: usize) -> Self {
        self.pool_capacity = n;
        self
    }

    pub fn pool_prealloc(mut self, n: usize) -> Self {
        self.pool_prealloc = n;
        self
    }

    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    pub fn reactor_tick(mut self, d: Duration) -> Self {
        self.reactor_tick = d;
        self
    }

    pub fn completion_channel(mut self, n: usize) -> Self {
        self.completion_channel = n;
        self
    }

    /// Free-list capacity after resolving the "same as depth" default.
    pub fn effective_pool_capacity(&self) -> usize {
        if self.pool_capacity == 0 {
            self.max_concurrent as usize
        } else {
            self.pool_capacity
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(DioError::InvalidState("max_concurrent must be > 0"));
        }
        if self.max_batch == 0 {
            return Err(DioError::InvalidState("max_batch must be > 0"));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(DioError::InvalidState("alignment must be a power of two"));
        }
        if self.pool_block_size == 0 || self.pool_block_size % self.alignment != 0 {
            return Err(DioError::InvalidState("pool block size must be a multiple of alignment"));
        }
        if self.completion_channel == 0 {
            return Err(DioError::InvalidState("completion channel capacity must be > 0"));
        }
        Ok(())
    }
}
