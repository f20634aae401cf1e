//! Interrupt delivery.
//!
//! Devices signal the guest through an interrupt sink bound to one line of
//! an [`IrqController`]. The controller tells the device about the guest's
//! end-of-interrupt through the [`EoiHandler`] registered for that line.
//!
//! ```text
//!  device ──inject()──► IrqSink ──set(line)──► IrqController ──► vCPU
//!    ▲                                              │
//!    └──────────────── eoi() ◄── EoiHandler ◄───────┘  (guest EOI)
//! ```
//!
//! Handlers are registered by line number. The controller only keeps weak
//! references, so a handler that is dropped is unbound with it.

pub mod lines;
pub mod passthrough;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use lines::LineTable;
pub use passthrough::{HwIrq, HwIrqError, HwIrqPassthrough};
pub use sink::{IrqEdgeSink, IrqSink};

use crate::error::SetupError;
use std::fmt;
use std::sync::Arc;

/// A vCPU execution context that interrupts can be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcpuId(pub u32);

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vcpu{}", self.0)
    }
}

/// Receiver of end-of-interrupt notifications for one line.
pub trait EoiHandler: Send + Sync {
    /// The guest finished servicing the interrupt.
    fn eoi(&self);

    /// The guest changed the priority of the line.
    fn set_priority(&self, prio: u32);
}

/// Handler for an interrupt that is injected directly into a vCPU.
pub trait VirqHandler: EoiHandler {
    /// Route the interrupt to `vcpu`. Failing to do so is fatal.
    fn bind(&self, vcpu: VcpuId, cfg: u32) -> Result<(), SetupError>;
    fn unbind(&self);
    fn enable(&self);
    fn disable(&self);
    fn set_pending(&self);
    fn clear_pending(&self);
}

/// Generic interrupt controller capability.
///
/// Implementations serialize concurrent calls from different vCPUs
/// themselves; callers hold no locks of their own around these calls.
pub trait IrqController: Send + Sync {
    /// Assert `line`. Lines without a handler are legal.
    fn set(&self, line: u32);

    /// Deassert `line`.
    fn clear(&self, line: u32);

    /// Bind `handler` to `line`, or unbind with `None`.
    ///
    /// Binding a different handler over a live one is a
    /// [`SetupError::HandlerAlreadyBound`]. Rebinding the same handler is
    /// accepted and never demotes a virq binding to a plain EOI one.
    fn bind_eoi_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn EoiHandler>>,
    ) -> Result<(), SetupError>;

    /// Same rules as [`IrqController::bind_eoi_handler`].
    fn bind_virq_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError>;

    /// Bind a handler for a CPU-local line.
    fn bind_cpulocal_virq_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError>;

    /// The handler currently bound to `line`, if any.
    fn eoi_handler(&self, line: u32) -> Option<Arc<dyn EoiHandler>>;
}
