//! A guest VM: run state and MMIO trap dispatch.
//!
//! The vCPU loop hands every trapped MMIO access to [`Guest::handle_mmio`].
//! The faulting address is looked up in the guest's [`RegionMap`]; a hit
//! forwards the decoded access to the owning device, a miss is handled
//! according to the guest's [`FaultMode`].
//!
//! ```text
//!          add_mmio_device()           handle_mmio()
//!  setup ─────────────────► RegionMap ◄────────────── vCPU trap
//!   (&mut Guest)                          (&Guest, any vCPU)
//! ```
//!
//! Devices are only added through `&mut Guest`, so the map cannot change
//! once the guest is shared with running vCPUs.

use crate::error::SetupError;
use crate::mem::{GuestAddr, Region, RegionMap};
use crate::mmio::{self, AccessContext, MemAccess, MmioDevice, TrapOutcome, TrappedAccess};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Run state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopped,
    Shutdown,
    Crashed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Running => "running",
            State::Stopped => "stopped",
            State::Shutdown => "shutdown",
            State::Crashed => "crashed",
        })
    }
}

/// Notified after every actual change of a guest's state.
pub trait StateListener: Send + Sync {
    fn state_changed(&self, vm: &str, state: State);
}

/// What to do with an access that no device handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Stop the guest.
    Halt,
    /// Loads read zero, stores are dropped.
    Ignore,
    /// Raise an abort in the guest. Halts if the vCPU cannot take one.
    #[default]
    Inject,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown fault mode '{0}' (expected halt, ignore or inject)")]
pub struct ParseFaultModeError(String);

impl FromStr for FaultMode {
    type Err = ParseFaultModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt" => Ok(FaultMode::Halt),
            "ignore" => Ok(FaultMode::Ignore),
            "inject" => Ok(FaultMode::Inject),
            other => Err(ParseFaultModeError(other.to_string())),
        }
    }
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultMode::Halt => "halt",
            FaultMode::Ignore => "ignore",
            FaultMode::Inject => "inject",
        })
    }
}

pub struct Guest<'d> {
    name: String,
    state: Mutex<State>,
    listener: Option<Arc<dyn StateListener>>,
    memmap: RegionMap<'d>,
    fault_mode: FaultMode,
    vcpu_time_us: AtomicU64,
    reset_requested: AtomicBool,
}

impl<'d> Guest<'d> {
    /// A stopped guest with an empty region map.
    pub fn new(name: impl Into<String>, fault_mode: FaultMode) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::Stopped),
            listener: None,
            memmap: RegionMap::new(),
            fault_mode,
            vcpu_time_us: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn fault_mode(&self) -> FaultMode {
        self.fault_mode
    }

    pub fn memmap(&self) -> &RegionMap<'d> {
        &self.memmap
    }

    /// Route trapped accesses within `region` to `device`.
    pub fn add_mmio_device(
        &mut self,
        region: Region,
        device: &'d dyn MmioDevice,
    ) -> Result<(), SetupError> {
        self.memmap.add_mmio_device(region, device)?;
        tracing::info!(
            target: "core",
            vm = %self.name,
            %region,
            device = device.name(),
            "MMIO device added"
        );
        Ok(())
    }

    /// Handle an MMIO trap at `pfa`.
    pub fn handle_mmio(&self, pfa: GuestAddr, trap: &mut dyn TrappedAccess) -> TrapOutcome {
        let hit = self.memmap.find(&Region::point(pfa));

        // A miss has no owning region; report the absolute address.
        let offset = hit.map_or(pfa.get(), |(region, _)| pfa - region.start());
        let access = mmio::decode(&self.name, pfa, offset, trap);
        if access == MemAccess::Other {
            return TrapOutcome::JumpInstr;
        }

        let Some((region, device)) = hit else {
            return self.handle_fault(pfa, access, trap);
        };

        let ctx = AccessContext {
            vm: &self.name,
            pfa,
            offset,
            region,
        };
        match device.access(&ctx, access, trap) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    target: "dev",
                    vm = %self.name,
                    device = device.name(),
                    "{err}"
                );
                self.handle_fault(pfa, access, trap)
            }
        }
    }

    fn handle_fault(
        &self,
        pfa: GuestAddr,
        access: MemAccess,
        trap: &mut dyn TrappedAccess,
    ) -> TrapOutcome {
        let what = match access {
            MemAccess::Load { .. } => "load from",
            _ => "store to",
        };

        match self.fault_mode {
            FaultMode::Halt => {
                tracing::warn!(target: "core", vm = %self.name, "Invalid {what} {pfa}. Halting VM.");
                self.halt();
                TrapOutcome::Halt
            }
            FaultMode::Ignore => {
                tracing::warn!(target: "core", vm = %self.name, "Invalid {what} {pfa}. Ignoring.");
                trap.complete_load(0);
                TrapOutcome::JumpInstr
            }
            FaultMode::Inject => {
                if trap.inject_abort(pfa) {
                    tracing::warn!(
                        target: "core",
                        vm = %self.name,
                        "Invalid {what} {pfa}. Injecting abort."
                    );
                    return TrapOutcome::Retry;
                }
                tracing::warn!(
                    target: "core",
                    vm = %self.name,
                    "Invalid {what} {pfa}. Cannot inject abort, halting VM."
                );
                self.halt();
                TrapOutcome::Halt
            }
        }
    }

    /// Running -> Stopped. Returns whether the state changed.
    pub fn suspend(&self) -> bool {
        self.transition(|state| (state == State::Running).then_some(State::Stopped))
    }

    /// Stopped -> Running. Returns whether the state changed.
    pub fn resume(&self) -> bool {
        self.transition(|state| (state == State::Stopped).then_some(State::Running))
    }

    /// Ask the vCPU loop to restart the guest from its entry point.
    ///
    /// A running or stopped guest keeps its state. A guest that shut down or
    /// crashed becomes `Stopped` and waits for `resume`.
    pub fn reset(&self) {
        self.vcpu_time_us.store(0, Ordering::Relaxed);
        self.reset_requested.store(true, Ordering::Release);
        self.transition(|state| {
            matches!(state, State::Shutdown | State::Crashed).then_some(State::Stopped)
        });
    }

    /// The guest did something it cannot recover from.
    pub fn halt(&self) {
        self.transition(|_| Some(State::Crashed));
    }

    /// The guest powered itself off.
    pub fn shutdown(&self) {
        self.transition(|_| Some(State::Shutdown));
    }

    /// Consume a pending reset request.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    pub fn add_vcpu_time(&self, us: u64) {
        self.vcpu_time_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Accumulated vCPU run time in microseconds.
    pub fn vcpu_time_us(&self) -> u64 {
        self.vcpu_time_us.load(Ordering::Relaxed)
    }

    fn transition(&self, next: impl FnOnce(State) -> Option<State>) -> bool {
        let changed = {
            let mut state = self.state.lock();
            match next(*state) {
                Some(new) if new != *state => {
                    let old = std::mem::replace(&mut *state, new);
                    Some((old, new))
                }
                _ => None,
            }
        };

        let Some((old, new)) = changed else {
            return false;
        };

        tracing::info!(target: "core", vm = %self.name, %old, %new, "state changed");
        if let Some(listener) = &self.listener {
            listener.state_changed(&self.name, new);
        }
        true
    }
}
