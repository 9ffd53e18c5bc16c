//! Raw bindings to Linux native AIO.
//!
//! Mirrors `<linux/aio_abi.h>`, the kernel ABI behind `io_setup(2)`,
//! `io_submit(2)`, `io_getevents(2)`, `io_cancel(2)` and `io_destroy(2)`.
//! libc exposes the syscall numbers but not the structures.

use std::time::Duration;

use libc::{c_long, timespec};
use nix::errno::Errno;

/// `aio_context_t`. 0 means "no context".
pub type AioContext = libc::c_ulong;

// ── IOCB_CMD_* ──

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

// ── I/O control block (64 bytes) ──
//
// aio_key and aio_rw_flags swap places on big-endian targets
// (PADDED() macro in aio_abi.h).

#[cfg(target_endian = "little")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    /// Returned verbatim in `IoEvent::data`.
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

#[cfg(target_endian = "big")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_rw_flags: i32,
    pub aio_key: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    /// `io_prep_pread()` equivalent.
    pub fn pread(data: u64, fd: i32, buf: *mut u8, len: usize, offset: u64) -> Self {
        Self {
            aio_data: data,
            aio_lio_opcode: IOCB_CMD_PREAD,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Default::default()
        }
    }

    /// `io_prep_pwrite()` equivalent.
    pub fn pwrite(data: u64, fd: i32, buf: *const u8, len: usize, offset: u64) -> Self {
        Self {
            aio_data: data,
            aio_lio_opcode: IOCB_CMD_PWRITE,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Default::default()
        }
    }
}

// ── Completion event (32 bytes) ──

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvent {
    /// `aio_data` of the originating iocb.
    pub data: u64,
    /// Address of the originating iocb.
    pub obj: u64,
    /// Byte count or negative errno.
    pub res: i64,
    pub res2: i64,
}

const _: () = assert!(std::mem::size_of::<Iocb>() == 64);
const _: () = assert!(std::mem::size_of::<IoEvent>() == 32);

// ── Syscalls ──

pub fn io_setup(nr_events: u32, ctx: &mut AioContext) -> nix::Result<()> {
    // Safety: ctx is a valid out-pointer; the kernel requires *ctx == 0.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_setup,
            nr_events as c_long,
            ctx as *mut AioContext,
        )
    };
    Errno::result(ret).map(drop)
}

pub fn io_destroy(ctx: AioContext) -> nix::Result<()> {
    // Safety: plain value argument.
    let ret = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    Errno::result(ret).map(drop)
}

/// Returns the number of iocbs accepted.
///
/// # Safety
///
/// Every pointer in `iocbs` must reference a live `Iocb` whose buffer
/// stays valid until its completion is reaped.
pub unsafe fn io_submit(ctx: AioContext, iocbs: &mut [*mut Iocb]) -> nix::Result<usize> {
    let ret = libc::syscall(
        libc::SYS_io_submit,
        ctx,
        iocbs.len() as c_long,
        iocbs.as_mut_ptr(),
    );
    Errno::result(ret).map(|n| n as usize)
}

/// Relative timeout for `io_getevents()`. Seconds beyond `time_t`
/// saturate instead of wrapping negative (which the kernel rejects).
fn to_timespec(d: Duration) -> timespec {
    timespec {
        tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// Returns the number of events written to `events`. `None` blocks.
pub fn io_getevents(
    ctx: AioContext,
    min_nr: usize,
    events: &mut [IoEvent],
    timeout: Option<Duration>,
) -> nix::Result<usize> {
    let ts = timeout.map(to_timespec);
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const timespec);
    // Safety: events is a valid buffer of events.len() entries; ts_ptr is
    // null or points to a live timespec.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_nr as c_long,
            events.len() as c_long,
            events.as_mut_ptr(),
            ts_ptr,
        )
    };
    Errno::result(ret).map(|n| n as usize)
}

/// # Safety
///
/// `iocb` must be the address passed to a previous `io_submit()` on `ctx`.
pub unsafe fn io_cancel(ctx: AioContext, iocb: *mut Iocb, result: &mut IoEvent) -> nix::Result<()> {
    let ret = libc::syscall(libc::SYS_io_cancel, ctx, iocb, result as *mut IoEvent);
    Errno::result(ret).map(drop)
}
