//! Virtual Machine creation, memory slots and interrupt lines.
//!
//! Before a VM can run, two x86-specific components must be initialized:
//!
//! ## TSS (Task State Segment)
//!
//! Intel VT-x requires a valid TSS address even though we don't use hardware
//! task switching.
//!
//! ## IRQ Chip (Interrupt Controllers)
//!
//! KVM emulates the legacy PIC and the IOAPIC in-kernel. Lines are driven
//! from user space with `KVM_IRQ_LINE`, or from an eventfd registered as an
//! irqfd for a GSI. A resampling irqfd reports the guest's EOI back through
//! a second eventfd.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses. Guest accesses outside
//! every slot exit to user space as MMIO.

use super::{KvmError, VcpuFd};
use crate::irq::VcpuId;
use kvm_bindings::kvm_userspace_memory_region;
use vmm_sys_util::eventfd::EventFd;

/// TSS location in the hole below 4 GiB. It needs no backing memory.
const TSS_ADDRESS: usize = 0xfffb_d000;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    /// Wrap `vm`, setting the TSS address and creating the in-kernel
    /// irqchip. Both must happen before any vCPU is created.
    pub fn new(vm: kvm_ioctls::VmFd) -> Result<Self, KvmError> {
        vm.set_tss_address(TSS_ADDRESS)
            .map_err(KvmError::SetTssAddress)?;
        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        Ok(Self { vm })
    }

    /// Register a guest memory region with KVM.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The host memory region remains valid for the lifetime of the VM
    /// - The memory is not freed while the VM is running
    /// - The region doesn't overlap with other registered regions
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    pub fn create_vcpu(&self, id: VcpuId) -> Result<VcpuFd, KvmError> {
        let vcpu = self
            .vm
            .create_vcpu(u64::from(id.0))
            .map_err(KvmError::CreateVcpu)?;

        tracing::trace!(target: "cpu", %id, "vCPU created");
        Ok(VcpuFd::new(vcpu, id))
    }

    /// Drive the level of an irqchip input.
    pub fn set_irq_line(&self, line: u32, active: bool) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(line, active)
            .map_err(|source| KvmError::SetIrqLine { line, source })
    }

    /// Assert `gsi` whenever `evt` is written.
    ///
    /// The line stays asserted until the guest EOIs it; KVM then deasserts
    /// it and writes `resample`.
    pub fn register_irqfd_with_resample(
        &self,
        evt: &EventFd,
        resample: &EventFd,
        gsi: u32,
    ) -> Result<(), KvmError> {
        self.vm
            .register_irqfd_with_resample(evt, resample, gsi)
            .map_err(|source| KvmError::RegisterIrqfd { gsi, source })
    }

    pub fn unregister_irqfd(&self, evt: &EventFd, gsi: u32) -> Result<(), KvmError> {
        self.vm
            .unregister_irqfd(evt, gsi)
            .map_err(|source| KvmError::UnregisterIrqfd { gsi, source })
    }
}
