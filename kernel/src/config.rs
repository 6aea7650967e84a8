//! # Kernel Configuration
//!
//! Compile-time tunables of the process subsystem. These numbers size the
//! process pool granularity, bound what a single process may ask for, and
//! fix the layout constants the loader and the userspace toolchain agree
//! on. The linker script of userspace programs must match `DATA_BASE`.

/// Size of the minimum allocatable process pool block, as a power of two
/// exponent. 10 means 1 KiB blocks.
pub const POOL_BLOCK_BITS: usize = 10;

/// Size in bytes of the minimum allocatable process pool block.
pub const POOL_BLOCK_SIZE: usize = 1 << POOL_BLOCK_BITS;

/// Upper bound on the RAM image of a single process, main stack included.
pub const MAX_PROCESS_IMAGE_SIZE: usize = 64 * 1024;

/// Smallest accepted main stack for a process.
pub const MIN_PROCESS_STACK_SIZE: usize = 2 * 1024;

/// Maximum number of entries in each of the argv and envp arrays.
pub const MAX_PROCESS_ARGS: usize = 16;

/// Upper bound on the packed argv/envp block, alignment padding included.
pub const MAX_PROCESS_ARGS_BLOCK_SIZE: usize = 1024;

/// Length in bytes of the stack overflow detection area at the top of each
/// process image.
pub const WATERMARK_LEN: usize = 16;

/// Fill pattern of the watermark area, repeated per 32 bit word.
pub const WATERMARK_FILL: u32 = 0xaa55_aa55;

/// Alignment the hardware context save code requires of stack pointers.
/// The block of argv/envp data becomes the initial stack pointer of a new
/// process, so its size is padded to this.
pub const CTXSAVE_STACK_ALIGNMENT: usize = 8;

/// Virtual base address of the writable segment in Ferrox executables.
/// The loader rewrites every data pointer from this symbolic base to the
/// address the image was actually placed at.
pub const DATA_BASE: u32 = 0x4000_0000;

/// Number of slots in each process file descriptor table.
pub const MAX_OPEN_FILES: usize = 8;

/// Capacity in bytes of the ring buffer behind each pipe.
pub const PIPE_BUFFER_SIZE: usize = 512;
