//! # Ferrox Kernel
//!
//! A memory-protected real-time operating system for 32-bit ARM Cortex-M
//! microcontrollers. What makes it a *protected* RTOS rather than a
//! cooperative thread library is the process subsystem in this crate:
//!
//! 1. **ELF validation and loading** (`process::elf`, `process::image`):
//!    full-recognition parsing of ARM ELF32 executables and
//!    position-independent relocation into RAM
//! 2. **Process pool** (`mm::pool`): naturally aligned power-of-two
//!    blocks, the shape the MPU can protect exactly
//! 3. **Process lifecycle** (`process`): PID table, parent/child
//!    tracking, zombie reaping, per-process file descriptor inheritance
//! 4. **The user/kernel boundary** (`syscall`, `mm::mpu`): supervisor
//!    call dispatch with exhaustive pointer validation against the
//!    caller's MPU regions
//! 5. **Scheduler cooperation** (`sched`): MPU state follows every
//!    context switch into a userspace thread
//!
//! A single oversight here - an unchecked pointer, a missing alignment
//! constraint, a relocation outside the data segment - converts into
//! arbitrary privilege escalation from an untrusted process, which is
//! why validation always completes before processing starts.
//!
//! The crate is a library; boards link it together with their drivers,
//! filesystems and the thread scheduler, then install those behind the
//! `fs::set_root` and `sched::set_scheduler` hooks.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;

#[cfg(test)]
pub(crate) mod testutil;

pub const NAME: &str = "Ferrox";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-stop initialization of the process subsystem. The board support
/// package calls this once, after memory is up and before the scheduler
/// starts, handing over the RAM arena reserved for process images.
pub fn init_processes(pool_base: usize, pool_size: usize) {
    mm::pool::init(pool_base, pool_size);
    arch::init_mpu();
    log::info!(
        "{} {}: process pool {:#x}..{:#x}",
        NAME,
        VERSION,
        pool_base,
        pool_base + pool_size
    );
}
