//! # dio-module — Default implementations
//!
//! This crate provides the default implementation for every dio-core
//! trait. Each impl favours correctness and simplicity.
//!
//! ## Default stack
//!
//! | Trait           | Default Impl  | Alternative                  |
//! |-----------------|---------------|------------------------------|
//! | AioBackend      | LinuxAio      | UringBackend (`DIO_BACKEND=uring`) |
//! | BufferProvider  | AlignedPool   | any `BufferProvider`         |
//!
//! `KernelQueue` wraps both backends so the choice can be made at
//! runtime from `EngineConfig::backend`.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod aio_sys;
        pub mod linux_aio;
        pub mod uring;
        pub mod kernel_queue;
        pub mod direct_file;

        pub use direct_file::open_direct;
        pub use kernel_queue::KernelQueue;
        pub use linux_aio::LinuxAio;
        pub use uring::UringBackend;
    } else {
        compile_error!("dio kernel queues require Linux (native AIO or io_uring)");
    }
}

pub mod aligned_pool;

pub use aligned_pool::AlignedPool;

