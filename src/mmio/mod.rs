//! Trapped MMIO accesses: decoding and device dispatch.
//!
//! A guest access to an address without RAM behind it traps to the monitor.
//! The trap source ([`TrappedAccess`]) knows how to decode the faulting
//! instruction into a [`MemAccess`] and how to complete a load. Devices
//! implement [`MmioDevice`] and see the decoded access together with the
//! offset into their region.

mod access;
mod device;
pub mod syndrome;

#[cfg(test)]
pub(crate) mod testing;

pub use access::{decode, AccessKind, MemAccess, TrappedAccess, Width};
pub use device::{AccessContext, MmioDevice, MmioError, RegisterDevice, RegisterMmio, TrapOutcome};
