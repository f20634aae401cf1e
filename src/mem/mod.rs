//! Guest-physical address space: regions and the MMIO region map.

mod map;
mod region;

pub use map::{RegionMap, DEFAULT_CAPACITY};
pub use region::{GuestAddr, Region};
