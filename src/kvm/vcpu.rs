//! Virtual CPU management and execution.
//!
//! The vCPU operates in a run loop:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                VMM (User Space)                │
//! │  ┌─────────┐        ┌────────────────────┐     │
//! │  │  Loop   │◄───────│ Guest::handle_mmio │     │
//! │  │  Start  │        │ port I/O stub      │     │
//! │  └────┬────┘        └─────────▲──────────┘     │
//! │       │ vcpu.run()            │ VM Exit        │
//! ├───────┼───────────────────────┼────────────────┤
//! │       ▼      KVM (Kernel)     │                │
//! │  ┌─────────┐            ┌─────┴─────┐          │
//! │  │  VMRUN  │───────────►│   VMEXIT  │          │
//! │  └─────────┘   Guest    └───────────┘          │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! KVM decodes MMIO accesses itself and completes a read on the next
//! `KVM_RUN` with whatever the VMM left in the exit's data buffer.

use super::KvmError;
use crate::guest::Guest;
use crate::irq::VcpuId;
use crate::mem::GuestAddr;
use crate::mmio::{MemAccess, TrapOutcome, TrappedAccess, Width};
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;
use std::time::Instant;

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
    id: VcpuId,
}

/// Exit reasons from vCPU execution.
#[derive(Debug)]
pub enum VcpuExit {
    /// An MMIO access was dispatched through the guest.
    Mmio(TrapOutcome),

    /// Port I/O. No port devices exist; reads return all ones.
    Io,

    /// Guest executed HLT instruction.
    Hlt,

    /// Triple fault or explicit shutdown request.
    Shutdown,

    InternalError,

    /// Failed to enter guest mode, with the hardware failure reason.
    FailEntry(u64),

    /// System event (e.g., S3 sleep, reset).
    SystemEvent(u32),

    /// Unknown or unhandled exit reason.
    Unknown(&'static str),
}

/// A KVM MMIO exit as a trapped access.
///
/// Widths other than 1, 2, 4 or 8 bytes decode as [`MemAccess::Other`].
/// KVM offers no way to raise an abort from an MMIO exit.
pub enum KvmMmioTrap<'a> {
    Load { vcpu: VcpuId, data: &'a mut [u8] },
    Store { vcpu: VcpuId, data: &'a [u8] },
}

impl KvmMmioTrap<'_> {
    fn width(&self) -> Option<Width> {
        match self {
            KvmMmioTrap::Load { data, .. } => Width::from_bytes(data.len()),
            KvmMmioTrap::Store { data, .. } => Width::from_bytes(data.len()),
        }
    }
}

impl TrappedAccess for KvmMmioTrap<'_> {
    fn vcpu_id(&self) -> VcpuId {
        match self {
            KvmMmioTrap::Load { vcpu, .. } | KvmMmioTrap::Store { vcpu, .. } => *vcpu,
        }
    }

    fn decode(&self) -> MemAccess {
        let Some(width) = self.width() else {
            return MemAccess::Other;
        };

        match self {
            KvmMmioTrap::Load { .. } => MemAccess::Load { width },
            KvmMmioTrap::Store { data, .. } => {
                let mut bytes = [0u8; 8];
                bytes[..data.len()].copy_from_slice(data);
                MemAccess::Store {
                    width,
                    value: u64::from_le_bytes(bytes),
                }
            }
        }
    }

    fn complete_load(&mut self, value: u64) {
        if self.width().is_none() {
            return;
        }
        if let KvmMmioTrap::Load { data, .. } = self {
            let len = data.len();
            data.copy_from_slice(&value.to_le_bytes()[..len]);
        }
    }
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd, id: VcpuId) -> Self {
        Self { vcpu, id }
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Start executing at `entry` in 16-bit real mode.
    ///
    /// `entry` must lie in the first MiB. CS is chosen so that IP starts
    /// below 64 KiB.
    pub fn setup_real_mode(&self, entry: u64) -> Result<(), KvmError> {
        let mut sregs = self.get_sregs()?;
        let base = entry & 0xf_0000;
        sregs.cs.base = base;
        sregs.cs.selector = (base >> 4) as u16;
        self.set_sregs(&sregs)?;

        let regs = kvm_regs {
            rip: entry - base,
            // Bit 1 is reserved and always set.
            rflags: 0x2,
            ..Default::default()
        };
        self.set_regs(&regs)?;

        tracing::info!(target: "cpu", vcpu = %self.id, entry = %GuestAddr(entry), "vCPU reset");
        Ok(())
    }

    /// Run the vCPU until it exits, routing MMIO exits through `guest`.
    ///
    /// Time spent inside `KVM_RUN` is added to the guest's vCPU time.
    pub fn run(&mut self, guest: &Guest<'_>) -> Result<VcpuExit, KvmError> {
        let id = self.id;
        let started = Instant::now();
        let exit = self.vcpu.run();
        let spent = started.elapsed().as_micros();
        guest.add_vcpu_time(u64::try_from(spent).unwrap_or(u64::MAX));

        match exit.map_err(KvmError::Run)? {
            KvmVcpuExit::MmioRead(addr, data) => {
                let mut trap = KvmMmioTrap::Load { vcpu: id, data };
                Ok(VcpuExit::Mmio(guest.handle_mmio(GuestAddr(addr), &mut trap)))
            }

            KvmVcpuExit::MmioWrite(addr, data) => {
                let mut trap = KvmMmioTrap::Store { vcpu: id, data };
                Ok(VcpuExit::Mmio(guest.handle_mmio(GuestAddr(addr), &mut trap)))
            }

            KvmVcpuExit::IoIn(port, data) => {
                data.fill(0xff);
                tracing::trace!(
                    target: "cpu",
                    vcpu = %id,
                    port,
                    size = data.len(),
                    "unhandled port read"
                );
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::IoOut(port, data) => {
                tracing::trace!(target: "cpu", vcpu = %id, port, ?data, "unhandled port write");
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),

            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown("IrqWindowOpen")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}
