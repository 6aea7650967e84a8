//! # Memory Management
//!
//! Process-facing memory management: the process pool that carves
//! naturally aligned power-of-two blocks out of a reserved RAM arena, and
//! the per-process MPU configuration built on top of those blocks.
//!
//! There is no paging and no translation. Protection is purely the ARMv7-M
//! MPU constraining what a userspace thread may touch, which is why the
//! pool insists on blocks aligned to their own size: an MPU region can
//! then cover an allocation exactly.

pub mod mpu;
pub mod pool;

pub use mpu::MpuConfiguration;
pub use pool::{pool, PoolError, ProcessPool};
