//! The in-kernel PIC/IOAPIC as an [`IrqController`].

use super::VmFd;
use crate::error::SetupError;
use crate::irq::{EoiHandler, IrqController, LineTable, VirqHandler};
use std::sync::Arc;

/// Input pins of the in-kernel IOAPIC.
pub const IOAPIC_PINS: u32 = 24;

/// Controller over KVM's in-kernel irqchip.
///
/// Line levels are driven with `KVM_IRQ_LINE`. The irqchip has no per-CPU
/// lines, so CPU-local bindings are rejected. Guest EOIs arrive through the
/// resample eventfds of passthrough lines and are fed in with
/// [`KvmIrqChip::guest_eoi`].
pub struct KvmIrqChip {
    vm: Arc<VmFd>,
    lines: LineTable,
}

fn line_table() -> LineTable {
    LineTable::new(0, IOAPIC_PINS)
}

impl KvmIrqChip {
    pub fn new(vm: Arc<VmFd>) -> Arc<Self> {
        Arc::new(Self {
            vm,
            lines: line_table(),
        })
    }

    /// The guest acknowledged `line`. Returns whether a handler saw it.
    pub fn guest_eoi(&self, line: u32) -> bool {
        tracing::trace!(target: "irq", line, "guest eoi");
        self.lines.eoi(line)
    }

    fn drive(&self, line: u32, active: bool) {
        tracing::trace!(target: "irq", line, active, "irq line");
        if let Err(err) = self.vm.set_irq_line(line, active) {
            tracing::warn!(target: "irq", line, "{err}");
        }
    }
}

impl IrqController for KvmIrqChip {
    fn set(&self, line: u32) {
        self.drive(line, true);
    }

    fn clear(&self, line: u32) {
        self.drive(line, false);
    }

    fn bind_eoi_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn EoiHandler>>,
    ) -> Result<(), SetupError> {
        self.lines.bind_eoi(line, handler)
    }

    fn bind_virq_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError> {
        self.lines.bind_virq(line, handler)
    }

    fn bind_cpulocal_virq_handler(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError> {
        self.lines.bind_local_virq(line, handler)
    }

    fn eoi_handler(&self, line: u32) -> Option<Arc<dyn EoiHandler>> {
        self.lines.eoi_handler(line)
    }
}
