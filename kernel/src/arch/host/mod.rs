//! # Host Stand-in
//!
//! No-op MPU operations for non-ARM builds, so the portable process code
//! and its hosted tests link without the hardware.

use crate::mm::mpu::MpuConfiguration;

pub fn init_mpu() {}

pub fn enable_mpu(_cfg: &MpuConfiguration) {}

pub fn disable_mpu() {}
