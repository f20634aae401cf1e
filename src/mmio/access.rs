//! Decoded memory accesses.

use crate::irq::VcpuId;
use crate::mem::GuestAddr;
use std::fmt;

/// Access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    pub const fn bytes(self) -> u8 {
        1 << self as u8
    }

    pub const fn bits(self) -> u32 {
        (self.bytes() as u32) * 8
    }

    /// Width of an access of `len` bytes, if it is a power of two up to 8.
    pub const fn from_bytes(len: usize) -> Option<Self> {
        match len {
            1 => Some(Width::Byte),
            2 => Some(Width::Half),
            4 => Some(Width::Word),
            8 => Some(Width::Double),
            _ => None,
        }
    }

    /// Width from a two-bit log2 size field (ISS.SAS, load/store `size`).
    pub const fn from_log2(size: u32) -> Self {
        match size & 0b11 {
            0 => Width::Byte,
            1 => Width::Half,
            2 => Width::Word,
            _ => Width::Double,
        }
    }

    /// Mask covering the low `bits()` bits.
    pub const fn mask(self) -> u64 {
        match self {
            Width::Double => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

/// Access kind, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
    Other,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Load => "LOAD",
            AccessKind::Store => "STORE",
            AccessKind::Other => "OTHER",
        })
    }
}

/// One trapped instruction, decoded.
///
/// A load's destination stays with the trap source; the result is handed
/// back through [`TrappedAccess::complete_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Load { width: Width },
    Store { width: Width, value: u64 },
    /// An instruction the decoder does not understand.
    Other,
}

impl MemAccess {
    pub fn kind(&self) -> AccessKind {
        match self {
            MemAccess::Load { .. } => AccessKind::Load,
            MemAccess::Store { .. } => AccessKind::Store,
            MemAccess::Other => AccessKind::Other,
        }
    }

    pub fn width(&self) -> Option<Width> {
        match *self {
            MemAccess::Load { width } | MemAccess::Store { width, .. } => Some(width),
            MemAccess::Other => None,
        }
    }
}

/// The trapped instruction state of a vCPU.
pub trait TrappedAccess {
    /// The vCPU that trapped.
    fn vcpu_id(&self) -> VcpuId;

    /// Decode the trapped instruction.
    fn decode(&self) -> MemAccess;

    /// Deliver the result of a load to its destination.
    ///
    /// Ignored if the trapped access is not a load.
    fn complete_load(&mut self, value: u64);

    /// Raise an external abort at `pfa` in the guest.
    ///
    /// Returns `false` if the trap source cannot inject aborts.
    fn inject_abort(&mut self, _pfa: GuestAddr) -> bool {
        false
    }
}

/// Decode `trap` and report the access on the `mmio` log target.
///
/// `offset` is relative to the owning region. Recognised accesses are
/// logged at trace level, unrecognised ones as a warning.
pub fn decode(vm: &str, pfa: GuestAddr, offset: u64, trap: &dyn TrappedAccess) -> MemAccess {
    let access = trap.decode();

    match access.width() {
        Some(width) => tracing::trace!(
            target: "mmio",
            vm,
            %pfa,
            offset,
            kind = %access.kind(),
            width = width.bytes(),
            "MMIO access"
        ),
        None => tracing::warn!(
            target: "mmio",
            vm,
            %pfa,
            "MMIO access: unknown instruction. Ignored."
        ),
    }

    access
}
