//! Fixed-capacity map from guest-physical regions to MMIO devices.
//!
//! The map is filled once while the VM is set up and only read afterwards.
//! It never allocates: entries live in an inline array of `N` slots and a
//! lookup is a linear scan in insertion order.
//!
//! Overlapping or duplicate regions are accepted. A lookup returns the
//! first inserted region that contains the query, so the earliest
//! registration wins.

use super::Region;
use crate::error::SetupError;
use crate::mmio::MmioDevice;

/// Capacity for the interrupt controller's distributor + redistributor.
pub const DEFAULT_CAPACITY: usize = 2;

/// Region map holding up to `N` devices.
///
/// Devices are borrowed, not owned: they must outlive the map.
pub struct RegionMap<'d, const N: usize = DEFAULT_CAPACITY> {
    entries: [Option<(Region, &'d dyn MmioDevice)>; N],
    len: usize,
}

impl<'d, const N: usize> RegionMap<'d, N> {
    pub const fn new() -> Self {
        Self {
            entries: [const { None }; N],
            len: 0,
        }
    }

    /// Route accesses within `region` to `device`.
    pub fn add_mmio_device(
        &mut self,
        region: Region,
        device: &'d dyn MmioDevice,
    ) -> Result<(), SetupError> {
        self.insert(region, device)
    }

    /// Append an entry. A full map is left untouched.
    pub fn insert(
        &mut self,
        region: Region,
        device: &'d dyn MmioDevice,
    ) -> Result<(), SetupError> {
        let slot = self
            .entries
            .get_mut(self.len)
            .ok_or(SetupError::RegionMapFull { capacity: N })?;

        *slot = Some((region, device));
        self.len += 1;
        Ok(())
    }

    /// First entry whose region contains all of `key`.
    ///
    /// An empty key matches nothing.
    pub fn find(&self, key: &Region) -> Option<(Region, &'d dyn MmioDevice)> {
        if key.size() == 0 {
            return None;
        }
        self.iter().find(|(region, _)| region.contains(key))
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Region, &'d dyn MmioDevice)> + '_ {
        self.entries[..self.len].iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for RegionMap<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}
