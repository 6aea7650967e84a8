//! # ARMv7-M (PMSAv7) MPU Programming
//!
//! The audited unsafe interior: raw writes to the MPU registers. Region
//! words are computed by portable code in `mm::mpu`; this module only
//! moves them into the hardware.
//!
//! Regions 0..=5 are owned by the board support package's static kernel
//! layout and are never touched here; the process regions are 6 and 7.

use crate::mm::mpu::{MpuConfiguration, CODE_REGION, DATA_REGION};

const MPU_CTRL: *mut u32 = 0xE000_ED94 as *mut u32;
const MPU_RBAR: *mut u32 = 0xE000_ED9C as *mut u32;
const MPU_RASR: *mut u32 = 0xE000_EDA0 as *mut u32;

const CTRL_ENABLE: u32 = 1 << 0;
/// Privileged code falls through to the default memory map; unprivileged
/// code sees only the programmed regions.
const CTRL_PRIVDEFENA: u32 = 1 << 2;
const RBAR_VALID: u32 = 1 << 4;

/// Turns the MPU on with the privileged-default map. Called once at
/// boot, before the first process thread runs.
pub fn init_mpu() {
    // SAFETY: writing the architectural MPU control register; the memory
    // barrier below orders it against following instruction fetches
    unsafe {
        MPU_CTRL.write_volatile(CTRL_ENABLE | CTRL_PRIVDEFENA);
        core::arch::asm!("dsb", "isb");
    }
}

/// Programs the two regions of `cfg` into the hardware. Called by the
/// scheduler immediately before resuming a userspace-mode thread, with
/// interrupts disabled.
pub fn enable_mpu(cfg: &MpuConfiguration) {
    for words in cfg.region_words() {
        // SAFETY: RBAR carries the region number and the VALID bit, so
        // the RBAR/RASR pair lands in that region atomically with respect
        // to the region number register
        unsafe {
            MPU_RBAR.write_volatile(words.rbar);
            MPU_RASR.write_volatile(words.rasr);
        }
    }
    // SAFETY: barrier so the new regions take effect before the exception
    // return that drops to unprivileged code
    unsafe {
        core::arch::asm!("dsb", "isb");
    }
}

/// Clears the process regions. Called by the scheduler before resuming a
/// kernel thread or a process thread running in kernelspace mode.
pub fn disable_mpu() {
    for region in [CODE_REGION, DATA_REGION] {
        // SAFETY: writing a zero RASR disables the region selected by the
        // RBAR write
        unsafe {
            MPU_RBAR.write_volatile(region | RBAR_VALID);
            MPU_RASR.write_volatile(0);
        }
    }
    // SAFETY: same ordering requirement as enable_mpu
    unsafe {
        core::arch::asm!("dsb", "isb");
    }
}
