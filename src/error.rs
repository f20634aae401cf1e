//! Setup errors.
//!
//! Everything in here describes a malformed interrupt or memory topology.
//! None of these are recoverable: they surface to process start-up, which
//! reports them as fatal and exits.

use crate::irq::HwIrqError;
use thiserror::Error;

/// A configuration defect detected while building the VM.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Another handler already owns the EOI/virq slot of this line.
    #[error("line {line} already has a different EOI handler bound")]
    HandlerAlreadyBound { line: u32 },

    /// The line number is outside the controller's line table.
    #[error("line {line} is outside the controller's {lines} lines")]
    LineOutOfRange { line: u32, lines: u32 },

    /// A CPU-local binding was requested for a shared line.
    #[error("line {line} is not one of the controller's {local} CPU-local lines")]
    NotCpuLocal { line: u32, local: u32 },

    /// The region map is already holding `capacity` entries.
    #[error("region map overflow (capacity {capacity})")]
    RegionMapFull { capacity: usize },

    /// The physical interrupt could not be bound to the vCPU.
    #[error("failed to bind irq on line {line} to vCPU: {source}")]
    BindVcpu {
        line: u32,
        #[source]
        source: HwIrqError,
    },
}
