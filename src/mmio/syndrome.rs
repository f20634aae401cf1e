//! AArch64 data-abort decoding.
//!
//! A stage-2 data abort reports the access in the ISS field of `ESR_EL2`.
//! When the ISV bit is set the syndrome alone describes a single-register
//! load or store:
//!
//! ```text
//!   24   23:22  21   20:16  15   ...  6
//!  ISV   SAS   SSE   SRT    SF        WnR
//! ```
//!
//! If ISV is clear the hardware gives up and the faulting instruction must
//! be read from guest memory. [`SyndromeTrap`] then falls back to decoding
//! it, covering the unsigned-offset `LDR`/`STR` family that compilers use for
//! MMIO register accesses.
//!
//! This is library API for AArch64 monitors; the KVM binary is x86 only and
//! gets its accesses pre-decoded through `kvm::KvmMmioTrap` instead.

use super::{MemAccess, TrappedAccess, Width};
use crate::irq::VcpuId;
use crate::mem::GuestAddr;

/// Index of the zero register in the `Rt`/`SRT` encoding.
const ZR: u8 = 31;

/// Instruction-specific syndrome of a data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbortIss(pub u32);

impl DataAbortIss {
    /// Instruction syndrome valid.
    pub fn isv(self) -> bool {
        self.0 & (1 << 24) != 0
    }

    /// Syndrome access size, as log2 of the byte count.
    pub fn sas(self) -> u32 {
        (self.0 >> 22) & 0b11
    }

    /// Syndrome sign extend.
    pub fn sse(self) -> bool {
        self.0 & (1 << 21) != 0
    }

    /// Syndrome register transfer.
    pub fn srt(self) -> u8 {
        ((self.0 >> 16) & 0x1f) as u8
    }

    /// Destination is a 64-bit register.
    pub fn sf(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    /// Write, not read.
    pub fn wnr(self) -> bool {
        self.0 & (1 << 6) != 0
    }
}

/// A fully resolved single-register transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transfer {
    width: Width,
    reg: u8,
    store: bool,
    sign_extend: bool,
    /// 64-bit destination; otherwise the upper half is zeroed.
    wide: bool,
}

impl Transfer {
    fn from_iss(iss: DataAbortIss) -> Option<Self> {
        if !iss.isv() {
            return None;
        }
        Some(Self {
            width: Width::from_log2(iss.sas()),
            reg: iss.srt(),
            store: iss.wnr(),
            sign_extend: iss.sse(),
            wide: iss.sf(),
        })
    }

    /// `LDR*`/`STR*` (immediate, unsigned offset) to a general register.
    fn from_insn(insn: u32) -> Option<Self> {
        if insn & 0x3f00_0000 != 0x3900_0000 {
            return None;
        }

        let size = insn >> 30;
        let reg = (insn & 0x1f) as u8;
        let width = Width::from_log2(size);

        let (store, sign_extend, wide) = match (insn >> 22) & 0b11 {
            0b00 => (true, false, size == 3),
            0b01 => (false, false, size == 3),
            // LDRS* to X; with size 3 this slot encodes PRFM.
            0b10 if size < 3 => (false, true, true),
            // LDRS* to W; LDRSW has no W form.
            0b11 if size < 2 => (false, true, false),
            _ => return None,
        };

        Some(Self {
            width,
            reg,
            store,
            sign_extend,
            wide,
        })
    }

    fn extend(&self, value: u64) -> u64 {
        let mut value = value & self.width.mask();
        if self.sign_extend && self.width != Width::Double {
            let shift = 64 - self.width.bits();
            value = (((value << shift) as i64) >> shift) as u64;
        }
        if !self.wide {
            value &= 0xffff_ffff;
        }
        value
    }
}

/// A trapped data abort on an AArch64 vCPU.
///
/// Borrows the vCPU's general registers `x0`..`x30` for the duration of the
/// exit.
pub struct SyndromeTrap<'a> {
    vcpu: VcpuId,
    transfer: Option<Transfer>,
    regs: &'a mut [u64; 31],
    abort: Option<GuestAddr>,
}

impl<'a> SyndromeTrap<'a> {
    /// Decode from the syndrome. `insn` is the faulting instruction, if the
    /// caller fetched it, and is only consulted when the syndrome is invalid.
    pub fn new(
        vcpu: VcpuId,
        iss: DataAbortIss,
        insn: Option<u32>,
        regs: &'a mut [u64; 31],
    ) -> Self {
        let transfer = Transfer::from_iss(iss).or_else(|| insn.and_then(Transfer::from_insn));
        Self {
            vcpu,
            transfer,
            regs,
            abort: None,
        }
    }

    /// Address of the abort injected into the guest, if any.
    pub fn injected_abort(&self) -> Option<GuestAddr> {
        self.abort
    }

    fn reg(&self, reg: u8) -> u64 {
        match reg {
            ZR => 0,
            n => self.regs[usize::from(n)],
        }
    }
}

impl TrappedAccess for SyndromeTrap<'_> {
    fn vcpu_id(&self) -> VcpuId {
        self.vcpu
    }

    fn decode(&self) -> MemAccess {
        match self.transfer {
            Some(t) if t.store => MemAccess::Store {
                width: t.width,
                value: self.reg(t.reg) & t.width.mask(),
            },
            Some(t) => MemAccess::Load { width: t.width },
            None => MemAccess::Other,
        }
    }

    fn complete_load(&mut self, value: u64) {
        let Some(t) = self.transfer.filter(|t| !t.store) else {
            return;
        };
        if t.reg == ZR {
            return;
        }
        self.regs[usize::from(t.reg)] = t.extend(value);
    }

    fn inject_abort(&mut self, pfa: GuestAddr) -> bool {
        self.abort = Some(pfa);
        true
    }
}
