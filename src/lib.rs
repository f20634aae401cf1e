//! tvmm - interrupt delivery and MMIO trap routing for a small VMM.
//!
//! The library holds everything that does not need a hypervisor: interrupt
//! sinks and the controller capability ([`irq`]), the guest-physical region
//! map ([`mem`]), trapped-access decoding ([`mmio`]) and the guest that ties
//! them together ([`guest`]). The [`kvm`] module backs these with Linux KVM
//! for the `tvmm` binary.

pub mod console;
pub mod control;
pub mod debug;
pub mod error;
pub mod guest;
pub mod irq;
pub mod mem;
pub mod mmio;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;
#[cfg(target_os = "linux")]
pub mod memory;

pub use error::SetupError;
