//! MMIO device interface.

use super::{MemAccess, TrappedAccess, Width};
use crate::irq::VcpuId;
use crate::mem::{GuestAddr, Region};
use thiserror::Error;

/// What the vCPU loop does after a trap has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum TrapOutcome {
    /// Re-execute the trapped instruction.
    Retry,
    /// Step past the trapped instruction.
    JumpInstr,
    /// The guest was halted and must not run again.
    Halt,
}

#[derive(Error, Debug)]
pub enum MmioError {
    #[error("unrecognised access at {0}")]
    Unrecognised(GuestAddr),

    #[error("access to offset {offset:#x} rejected")]
    Rejected { offset: u64 },
}

/// Where a trapped access landed.
#[derive(Debug, Clone, Copy)]
pub struct AccessContext<'a> {
    pub vm: &'a str,
    /// Faulting guest-physical address.
    pub pfa: GuestAddr,
    /// Offset of `pfa` into `region`.
    pub offset: u64,
    /// Region the device was registered for.
    pub region: Region,
}

/// A device reachable through trapped MMIO.
pub trait MmioDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one decoded access. Loads are completed through `trap`.
    ///
    /// An error is fatal for the guest.
    fn access(
        &self,
        ctx: &AccessContext<'_>,
        access: MemAccess,
        trap: &mut dyn TrappedAccess,
    ) -> Result<TrapOutcome, MmioError>;
}

/// Register-file devices: reads and writes at an offset, nothing else.
pub trait RegisterDevice: Send + Sync {
    fn read(&self, offset: u64, width: Width, cpu: VcpuId) -> u64;
    fn write(&self, offset: u64, width: Width, value: u64, cpu: VcpuId);
}

/// Adapts a [`RegisterDevice`] to [`MmioDevice`].
pub struct RegisterMmio<D> {
    name: &'static str,
    dev: D,
}

impl<D: RegisterDevice> RegisterMmio<D> {
    pub fn new(name: &'static str, dev: D) -> Self {
        Self { name, dev }
    }

    pub fn inner(&self) -> &D {
        &self.dev
    }
}

impl<D: RegisterDevice> MmioDevice for RegisterMmio<D> {
    fn name(&self) -> &str {
        self.name
    }

    fn access(
        &self,
        ctx: &AccessContext<'_>,
        access: MemAccess,
        trap: &mut dyn TrappedAccess,
    ) -> Result<TrapOutcome, MmioError> {
        let cpu = trap.vcpu_id();
        match access {
            MemAccess::Load { width } => {
                let value = self.dev.read(ctx.offset, width, cpu) & width.mask();
                trap.complete_load(value);
            }
            MemAccess::Store { width, value } => {
                self.dev.write(ctx.offset, width, value & width.mask(), cpu);
            }
            MemAccess::Other => return Err(MmioError::Unrecognised(ctx.pfa)),
        }
        Ok(TrapOutcome::JumpInstr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::testing::{FakeTrap, RegisterLog, ScratchRegisters};

    fn ctx(offset: u64) -> AccessContext<'static> {
        let region = Region::ss(GuestAddr(0x0800_0000), 0x1000);
        AccessContext {
            vm: "vm",
            pfa: region.start() + offset,
            offset,
            region,
        }
    }

    #[test]
    fn test_store_then_load() {
        let dev = RegisterMmio::new("scratch", ScratchRegisters::default());

        let mut trap = FakeTrap::store(Width::Word, 0xdead_beef);
        let out = dev.access(&ctx(0x10), trap.decode(), &mut trap).unwrap();
        assert_eq!(out, TrapOutcome::JumpInstr);

        let mut trap = FakeTrap::load(Width::Half);
        let _ = dev.access(&ctx(0x10), trap.decode(), &mut trap).unwrap();
        assert_eq!(trap.loaded, Some(0xbeef));
    }

    #[test]
    fn test_register_access_sees_offset_and_cpu() {
        let dev = RegisterMmio::new("scratch", ScratchRegisters::default());
        let mut trap = FakeTrap::store(Width::Byte, 0x1ff).on_vcpu(VcpuId(3));
        let _ = dev.access(&ctx(0x24), trap.decode(), &mut trap).unwrap();

        assert_eq!(
            dev.inner().log(),
            vec![RegisterLog::Write {
                offset: 0x24,
                width: Width::Byte,
                value: 0xff,
                cpu: VcpuId(3),
            }]
        );
    }

    #[test]
    fn test_unrecognised_access_is_an_error() {
        let dev = RegisterMmio::new("scratch", ScratchRegisters::default());
        let mut trap = FakeTrap::other();
        let err = dev.access(&ctx(0), MemAccess::Other, &mut trap).unwrap_err();
        assert!(matches!(err, MmioError::Unrecognised(GuestAddr(0x0800_0000))));
    }
}
