//! Test doubles for the MMIO path.

use super::{AccessContext, MemAccess, MmioDevice, MmioError, RegisterDevice, TrapOutcome};
use super::{TrappedAccess, Width};
use crate::irq::VcpuId;
use crate::mem::GuestAddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// A trapped access with a fixed decoding.
pub struct FakeTrap {
    vcpu: VcpuId,
    access: MemAccess,
    can_abort: bool,
    pub loaded: Option<u64>,
    pub aborts: Vec<GuestAddr>,
}

impl FakeTrap {
    fn with(access: MemAccess) -> Self {
        Self {
            vcpu: VcpuId(0),
            access,
            can_abort: true,
            loaded: None,
            aborts: Vec::new(),
        }
    }

    pub fn load(width: Width) -> Self {
        Self::with(MemAccess::Load { width })
    }

    pub fn store(width: Width, value: u64) -> Self {
        Self::with(MemAccess::Store { width, value })
    }

    pub fn other() -> Self {
        Self::with(MemAccess::Other)
    }

    pub fn on_vcpu(mut self, vcpu: VcpuId) -> Self {
        self.vcpu = vcpu;
        self
    }

    /// Refuse abort injection.
    pub fn no_abort(mut self) -> Self {
        self.can_abort = false;
        self
    }
}

impl TrappedAccess for FakeTrap {
    fn vcpu_id(&self) -> VcpuId {
        self.vcpu
    }

    fn decode(&self) -> MemAccess {
        self.access
    }

    fn complete_load(&mut self, value: u64) {
        if let MemAccess::Load { .. } = self.access {
            self.loaded = Some(value);
        }
    }

    fn inject_abort(&mut self, pfa: GuestAddr) -> bool {
        if self.can_abort {
            self.aborts.push(pfa);
        }
        self.can_abort
    }
}

/// Device that records what it sees and loads a fixed value.
pub struct NamedDevice {
    name: &'static str,
    reject: bool,
    seen: Mutex<Vec<(u64, MemAccess)>>,
}

impl NamedDevice {
    pub const LOAD_VALUE: u64 = 0x5a;

    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reject: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// A device that fails every access.
    pub fn rejecting(name: &'static str) -> Self {
        Self {
            reject: true,
            ..Self::new(name)
        }
    }

    pub fn seen(&self) -> Vec<(u64, MemAccess)> {
        self.seen.lock().clone()
    }
}

impl MmioDevice for NamedDevice {
    fn name(&self) -> &str {
        self.name
    }

    fn access(
        &self,
        ctx: &AccessContext<'_>,
        access: MemAccess,
        trap: &mut dyn TrappedAccess,
    ) -> Result<TrapOutcome, MmioError> {
        self.seen.lock().push((ctx.offset, access));
        if self.reject {
            return Err(MmioError::Rejected { offset: ctx.offset });
        }
        if let MemAccess::Load { .. } = access {
            trap.complete_load(Self::LOAD_VALUE);
        }
        Ok(TrapOutcome::JumpInstr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterLog {
    Read {
        offset: u64,
        width: Width,
        cpu: VcpuId,
    },
    Write {
        offset: u64,
        width: Width,
        value: u64,
        cpu: VcpuId,
    },
}

/// Plain read/write register file.
#[derive(Default)]
pub struct ScratchRegisters {
    regs: Mutex<HashMap<u64, u64>>,
    log: Mutex<Vec<RegisterLog>>,
}

impl ScratchRegisters {
    pub fn log(&self) -> Vec<RegisterLog> {
        self.log.lock().clone()
    }
}

impl RegisterDevice for ScratchRegisters {
    fn read(&self, offset: u64, width: Width, cpu: VcpuId) -> u64 {
        self.log.lock().push(RegisterLog::Read { offset, width, cpu });
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: u64, width: Width, value: u64, cpu: VcpuId) {
        self.log.lock().push(RegisterLog::Write {
            offset,
            width,
            value,
            cpu,
        });
        self.regs.lock().insert(offset, value);
    }
}

type Captured = Arc<Mutex<Vec<(String, Level)>>>;

struct CaptureLayer(Captured);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        self.0.lock().push((meta.target().to_string(), *meta.level()));
    }
}

/// Run `f` with a subscriber that records `(target, level)` of every event.
pub fn capture_events<T>(f: impl FnOnce() -> T) -> (T, Vec<(String, Level)>) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer(captured.clone()));

    let out = tracing::subscriber::with_default(subscriber, f);
    let events = captured.lock().clone();
    (out, events)
}
