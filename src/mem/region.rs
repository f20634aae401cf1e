//! Guest-physical addresses and address ranges.

use std::fmt;
use std::ops::{Add, Sub};

/// A guest-physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Add<u64> for GuestAddr {
    type Output = GuestAddr;

    fn add(self, rhs: u64) -> GuestAddr {
        GuestAddr(self.0.saturating_add(rhs))
    }
}

impl Sub for GuestAddr {
    type Output = u64;

    fn sub(self, rhs: GuestAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open range `[start, end)` of guest-physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    start: GuestAddr,
    end: GuestAddr,
}

impl Region {
    /// Region of `size` bytes starting at `start`.
    pub fn ss(start: GuestAddr, size: u64) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    /// Region from `start` up to, but excluding, `end`.
    ///
    /// An `end` below `start` yields an empty region at `start`.
    pub fn se(start: GuestAddr, end: GuestAddr) -> Self {
        debug_assert!(start <= end, "region end {end} below start {start}");
        Self {
            start,
            end: end.max(start),
        }
    }

    /// The single byte at `addr`, as used for trap lookups.
    ///
    /// The last byte of the address space has no half-open representation
    /// and yields an empty region, which no map lookup matches.
    pub fn point(addr: GuestAddr) -> Self {
        Self::ss(addr, 1)
    }

    pub fn start(&self) -> GuestAddr {
        self.start
    }

    pub fn end(&self) -> GuestAddr {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &Region) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_addr(&self, addr: GuestAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether `self` and `other` share at least one address.
    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}
