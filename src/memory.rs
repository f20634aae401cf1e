//! Guest physical memory using the vm-memory crate.
//!
//! RAM is a single anonymous mapping starting at guest-physical address 0.
//! Everything above it is unbacked: accesses there exit to the VMM as MMIO
//! and end up in the guest's region map.
//!
//! ```text
//! 0x00000000 ┌─────────────────┐
//!            │ IVT / BDA       │
//! load_addr  ├─────────────────┤
//!            │ flat image      │ ← vCPU starts here, real mode
//!            ├─────────────────┤
//!            │ free RAM        │
//! mem_size   ├─────────────────┤
//!            │ unbacked (MMIO) │
//!            └─────────────────┘
//! ```

use crate::mem::GuestAddr;
use std::path::Path;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Highest address a real-mode entry point can reach.
const REAL_MODE_LIMIT: u64 = 0x10_0000;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate {size:#x} bytes of guest memory: {reason}")]
    Allocate { size: u64, reason: String },

    #[error("guest memory access at {addr:#x} failed: {source}")]
    Access {
        addr: u64,
        #[source]
        source: vm_memory::GuestMemoryError,
    },

    #[error("failed to read guest image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image of {len:#x} bytes at {addr:#x} does not fit below {limit:#x}")]
    ImageTooLarge { addr: u64, len: u64, limit: u64 },
}

/// Guest RAM: one contiguous region at guest-physical 0.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = [(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| MemoryError::Allocate {
                size,
                reason: e.to_string(),
            })?;

        Ok(Self { inner, size })
    }

    /// Host address and size, for `set_user_memory_region`.
    ///
    /// The host address is valid only while this `GuestMemory` exists.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let host_addr = self
            .inner
            .iter()
            .next()
            .map_or(0, |region| region.as_ptr() as u64);
        (host_addr, self.size)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::Access { addr, source })
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::Access { addr, source })
    }

    /// Copy a flat binary to `addr`. The whole image must be reachable from
    /// real mode and fit in RAM.
    pub fn load_image(&self, image: &[u8], addr: u64) -> Result<(), MemoryError> {
        let len = image.len() as u64;
        let limit = self.size.min(REAL_MODE_LIMIT);
        if !matches!(addr.checked_add(len), Some(end) if end <= limit) {
            return Err(MemoryError::ImageTooLarge { addr, len, limit });
        }

        self.write(addr, image)?;
        tracing::info!(target: "core", addr = %GuestAddr(addr), len, "image loaded");
        Ok(())
    }

    pub fn load_image_file(&self, path: &Path, addr: u64) -> Result<(), MemoryError> {
        let image = std::fs::read(path).map_err(|source| MemoryError::ReadImage {
            path: path.display().to_string(),
            source,
        })?;
        self.load_image(&image, addr)
    }
}
