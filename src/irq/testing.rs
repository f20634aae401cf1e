//! Recording fakes for the interrupt traits.

use super::{EoiHandler, HwIrq, HwIrqError, IrqController, LineTable, VcpuId, VirqHandler};
use crate::error::SetupError;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcEvent {
    Set { ic: u8, line: u32 },
    Clear { ic: u8, line: u32 },
}

pub type IcLog = Arc<Mutex<Vec<IcEvent>>>;

/// Controller that records every set/clear into a (possibly shared) log.
pub struct RecordingController {
    id: u8,
    log: IcLog,
    lines: LineTable,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Self::with_log(0, IcLog::default())
    }

    pub fn with_log(id: u8, log: IcLog) -> Arc<Self> {
        Arc::new(Self {
            id,
            log,
            lines: LineTable::new(32, 64),
        })
    }

    pub fn events(&self) -> Vec<IcEvent> {
        self.log.lock().clone()
    }

    /// Simulate the guest acknowledging `line`.
    pub fn guest_eoi(&self, line: u32) -> bool {
        self.lines.eoi(line)
    }
}

impl IrqController for RecordingController {
    fn set(&self, line: u32) {
        self.log.lock().push(IcEvent::Set { ic: self.id, line });
    }

    fn clear(&self, line: u32) {
        self.log.lock().push(IcEvent::Clear { ic: self.id, line });
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

/// EOI handler counting its notifications.
#[derive(Default)]
pub struct CountingHandler {
    eois: Mutex<usize>,
    priority: Mutex<Option<u32>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn eois(&self) -> usize {
        *self.eois.lock()
    }

    pub fn priority(&self) -> Option<u32> {
        *self.priority.lock()
    }
}

impl EoiHandler for CountingHandler {
    fn eoi(&self) {
        *self.eois.lock() += 1;
    }

    fn set_priority(&self, prio: u32) {
        *self.priority.lock() = Some(prio);
    }
}

/// Virq handler that does nothing.
pub struct FakeVirq;

impl FakeVirq {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeVirq)
    }
}

impl EoiHandler for FakeVirq {
    fn eoi(&self) {}
    fn set_priority(&self, _prio: u32) {}
}

impl VirqHandler for FakeVirq {
    fn bind(&self, _vcpu: VcpuId, _cfg: u32) -> Result<(), SetupError> {
        Ok(())
    }
    fn unbind(&self) {}
    fn enable(&self) {}
    fn disable(&self) {}
    fn set_pending(&self) {}
    fn clear_pending(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCall {
    BindVcpu(VcpuId, u32),
    Detach,
    Unmask,
    SetPriority(u32),
    UnmaskVcpu,
    MaskVcpu,
    Trigger,
    ClearVcpu,
}

/// Physical interrupt that records every call.
pub struct FakeHwIrq {
    pub calls: Arc<Mutex<Vec<HwCall>>>,
    fail_bind: bool,
}

impl FakeHwIrq {
    pub fn new() -> Self {
        Self {
            calls: Arc::default(),
            fail_bind: false,
        }
    }

    /// A physical interrupt whose vCPU binding always fails.
    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            fail_bind: true,
        }
    }

    fn record(&self, call: HwCall) {
        self.calls.lock().push(call);
    }
}

impl HwIrq for FakeHwIrq {
    fn bind_vcpu(&self, vcpu: VcpuId, line: u32) -> Result<(), HwIrqError> {
        self.record(HwCall::BindVcpu(vcpu, line));
        if self.fail_bind {
            return Err(HwIrqError::Bind {
                line,
                source: "vCPU refused binding".into(),
            });
        }
        Ok(())
    }

    fn detach(&self) {
        self.record(HwCall::Detach);
    }

    fn unmask(&self) {
        self.record(HwCall::Unmask);
    }

    fn set_priority(&self, prio: u32) {
        self.record(HwCall::SetPriority(prio));
    }

    fn unmask_vcpu(&self) {
        self.record(HwCall::UnmaskVcpu);
    }

    fn mask_vcpu(&self) {
        self.record(HwCall::MaskVcpu);
    }

    fn trigger(&self) {
        self.record(HwCall::Trigger);
    }

    fn clear_vcpu(&self) {
        self.record(HwCall::ClearVcpu);
    }
}
