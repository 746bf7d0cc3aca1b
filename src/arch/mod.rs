/*
 * Architecture Abstraction Layer
 *
 * Instruction-level primitives for the processor the inmate runs on. Only
 * x86_64 is supported; everything above this layer reaches the hardware
 * through the functions exported here or through `hw::HwAccess`.
 */

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
