//! # Architecture Support
//!
//! The unsafe hardware interior of the process subsystem, kept behind a
//! two-function surface: `enable_mpu`/`disable_mpu`. Everything above
//! this module is safe code operating on validated sizes and indices.
//!
//! The real implementation targets ARMv7-M; every other build gets the
//! host module, whose MPU operations are no-ops, so the portable logic
//! can be exercised by hosted tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod armv7m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use armv7m::{disable_mpu, enable_mpu, init_mpu};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::{disable_mpu, enable_mpu, init_mpu};

/// Snapshot of a hardware fault taken by the fault handlers, delivered to
/// the faulting thread's process record and inspected by the dispatcher
/// after the return to kernelspace. No unwinding, no asynchronous signal
/// handlers: faults are plain data here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Program counter at the fault.
    pub pc: u32,
    /// Faulting data address, when the hardware captured one.
    pub address: u32,
    /// Raw fault status bits (CFSR on ARMv7-M).
    pub status: u32,
}

impl FaultInfo {
    pub fn log(&self) {
        log::error!(
            "* fault at pc={:#010x} address={:#010x} status={:#010x}",
            self.pc,
            self.address,
            self.status
        );
    }
}
