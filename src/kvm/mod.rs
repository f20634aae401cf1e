//! Linux KVM backing for the monitor binary.
//!
//! The VMM talks to KVM through ioctls on three kinds of file descriptors:
//!
//! - `/dev/kvm` - system-level operations (create VMs)
//! - VM file descriptor - memory slots, the in-kernel irqchip, irqfds
//! - vCPU file descriptor - registers and the run loop
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  KvmIrqChip ─┼── KVM_IRQ_LINE ──►│  PIC + IOAPIC    │
//! │  IrqfdLine ──┼── irqfd ─────────►│                  │
//! │  IrqfdWorker◄┼── resample ───────┤  (guest EOI)     │
//! │              │                   │                  │
//! │  VcpuFd ─────┼── KVM_RUN ───────►│  vCPU            │
//! │     ▲        │                   │    │             │
//! │     └────────┼── MMIO exit ◄─────┼────┘             │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! MMIO exits are decoded by KVM already; [`KvmMmioTrap`] presents them to
//! [`crate::guest::Guest::handle_mmio`] like any other trapped access.

mod irqchip;
mod irqfd;
mod vcpu;
mod vm;

pub use irqchip::{KvmIrqChip, IOAPIC_PINS};
pub use irqfd::{IrqfdLine, IrqfdWorker};
pub use vcpu::{KvmMmioTrap, VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// Failed to set TSS address (required for Intel VT-x).
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    /// Failed to create in-kernel IRQ chip.
    #[error("Failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("Failed to set level of irq line {line}: {source}")]
    SetIrqLine {
        line: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    /// Failed to attach an eventfd to a GSI.
    #[error("Failed to register irqfd for GSI {gsi}: {source}")]
    RegisterIrqfd {
        gsi: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to unregister irqfd for GSI {gsi}: {source}")]
    UnregisterIrqfd {
        gsi: u32,
        #[source]
        source: kvm_ioctls::Error,
    },
}

/// Open the KVM device and create a new virtual machine with an in-kernel
/// irqchip.
///
/// # Errors
///
/// Returns an error if:
/// - KVM is not available or accessible
/// - VM creation fails
/// - The TSS or irqchip cannot be set up
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmFd::new(vm)
}
