//! Physical interrupts backed by KVM irqfds.
//!
//! An [`IrqfdLine`] owns three eventfds:
//!
//! - the irqfd, registered for the line's GSI: a write raises the GSI inside
//!   the kernel without a trip through the VMM;
//! - the resample fd, which KVM writes when the guest EOIs the GSI;
//! - the source fd, written by whatever produces the physical interrupt.
//!
//! Like a level interrupt behind a real interrupt controller, the line masks
//! itself when it fires and stays masked until the guest's EOI unmasks it.
//! Events arriving while masked are latched and replayed on unmask.
//!
//! An [`IrqfdWorker`] services the source and resample fds of one
//! passthrough line from its own thread.
//!
//! ```text
//!  source fd ──► fire() ──► irqfd ──► GSI ──► guest
//!                  ▲                            │ EOI
//!                  └── unmask() ◄── KvmIrqChip ◄── resample fd
//! ```

use super::{KvmIrqChip, VmFd};
use crate::irq::{HwIrq, HwIrqError, HwIrqPassthrough, VcpuId};
use parking_lot::Mutex;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use vmm_sys_util::eventfd::EventFd;

/// Masking state of an auto-masking interrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MaskLatch {
    /// Fired and not yet unmasked.
    masked: bool,
    /// Held back by the vCPU side.
    held: bool,
    /// One event arrived while it could not be delivered.
    pending: bool,
}

impl MaskLatch {
    fn deliverable(&self) -> bool {
        !self.masked && !self.held
    }

    /// Returns whether to deliver now.
    fn fire(&mut self) -> bool {
        if self.deliverable() {
            self.masked = true;
            true
        } else {
            self.pending = true;
            false
        }
    }

    fn replay(&mut self) -> bool {
        if self.pending && self.deliverable() {
            self.pending = false;
            self.masked = true;
            true
        } else {
            false
        }
    }

    /// Returns whether a latched event must be delivered now.
    fn unmask(&mut self) -> bool {
        self.masked = false;
        self.replay()
    }

    fn hold(&mut self) {
        self.held = true;
    }

    fn release(&mut self) -> bool {
        self.held = false;
        self.replay()
    }

    fn clear(&mut self) {
        self.pending = false;
    }
}

/// The eventfds a line is serviced from.
struct LineEvents {
    source: EventFd,
    resample: EventFd,
}

impl LineEvents {
    fn new() -> io::Result<Self> {
        Ok(Self {
            source: EventFd::new(libc::EFD_NONBLOCK)?,
            resample: EventFd::new(libc::EFD_NONBLOCK)?,
        })
    }
}

/// An eventfd-backed physical interrupt.
pub struct IrqfdLine {
    vm: Arc<VmFd>,
    evt: EventFd,
    events: LineEvents,
    gsi: Mutex<Option<u32>>,
    state: Mutex<MaskLatch>,
}

impl IrqfdLine {
    pub fn new(vm: Arc<VmFd>) -> Result<Self, HwIrqError> {
        let evt = EventFd::new(libc::EFD_NONBLOCK).map_err(HwIrqError::Create)?;
        let events = LineEvents::new().map_err(HwIrqError::Create)?;

        Ok(Self {
            vm,
            evt,
            events,
            gsi: Mutex::new(None),
            state: Mutex::new(MaskLatch::default()),
        })
    }

    /// Writing this eventfd raises the physical interrupt.
    pub fn source_event(&self) -> &EventFd {
        &self.events.source
    }

    /// The physical side raised the interrupt.
    pub fn fire(&self) {
        if self.state.lock().fire() {
            self.signal();
        }
    }

    fn signal(&self) {
        if let Err(err) = self.evt.write(1) {
            let gsi = *self.gsi.lock();
            tracing::warn!(target: "irq", ?gsi, "irqfd write failed: {err}");
        }
    }
}

impl HwIrq for IrqfdLine {
    fn bind_vcpu(&self, vcpu: VcpuId, line: u32) -> Result<(), HwIrqError> {
        let mut gsi = self.gsi.lock();
        if *gsi == Some(line) {
            return Ok(());
        }
        if let Some(old) = gsi.take() {
            if let Err(err) = self.vm.unregister_irqfd(&self.evt, old) {
                tracing::warn!(target: "irq", gsi = old, "{err}");
            }
        }

        self.vm
            .register_irqfd_with_resample(&self.evt, &self.events.resample, line)
            .map_err(|err| HwIrqError::Bind {
                line,
                source: Box::new(err),
            })?;
        *gsi = Some(line);

        // The in-kernel irqchip routes the GSI; the vCPU is only reported.
        tracing::info!(target: "irq", gsi = line, %vcpu, "irqfd registered");
        Ok(())
    }

    fn detach(&self) {
        let Some(gsi) = self.gsi.lock().take() else {
            return;
        };
        match self.vm.unregister_irqfd(&self.evt, gsi) {
            Ok(()) => tracing::info!(target: "irq", gsi, "irqfd unregistered"),
            Err(err) => tracing::warn!(target: "irq", gsi, "{err}"),
        }
    }

    fn unmask(&self) {
        if self.state.lock().unmask() {
            self.signal();
        }
    }

    fn set_priority(&self, prio: u32) {
        // IOAPIC pins have no programmable priority.
        let gsi = *self.gsi.lock();
        tracing::trace!(target: "irq", ?gsi, prio, "priority ignored");
    }

    fn unmask_vcpu(&self) {
        if self.state.lock().release() {
            self.signal();
        }
    }

    fn mask_vcpu(&self) {
        self.state.lock().hold();
    }

    fn trigger(&self) {
        self.fire();
    }

    fn clear_vcpu(&self) {
        self.state.lock().clear();
    }
}

impl Drop for IrqfdLine {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Thread servicing one passthrough line.
///
/// Every source event fires the line and every resample event is reported
/// to the irqchip as the guest's EOI for the line. With a `period`, the
/// worker also fires the line whenever that much time passes without an
/// event, acting as a periodic interrupt source.
///
/// Dropping the worker stops and joins the thread.
pub struct IrqfdWorker {
    stop: Arc<AtomicBool>,
    wake: EventFd,
    thread: Option<JoinHandle<()>>,
}

impl IrqfdWorker {
    pub fn spawn(
        dev: Arc<HwIrqPassthrough<IrqfdLine>>,
        irqchip: Arc<KvmIrqChip>,
        period: Option<Duration>,
    ) -> io::Result<Self> {
        let wake = dev.hw_irq().source_event().try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let line = dev.line();

        let thread = std::thread::Builder::new()
            .name(format!("irqfd-{line}"))
            .spawn({
                let stop = stop.clone();
                move || {
                    let hw = dev.hw_irq();
                    service(
                        &hw.events,
                        &stop,
                        period,
                        || hw.fire(),
                        || {
                            if !irqchip.guest_eoi(line) {
                                tracing::trace!(target: "irq", line, "eoi without handler");
                            }
                        },
                    );
                }
            })?;

        tracing::info!(target: "irq", line, ?period, "irqfd worker started");
        Ok(Self {
            stop,
            wake,
            thread: Some(thread),
        })
    }
}

impl Drop for IrqfdWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.wake.write(1) {
            tracing::warn!(target: "irq", "failed to wake irqfd worker: {err}");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(target: "irq", "irqfd worker panicked");
            }
        }
    }
}

fn pollfd(evt: &EventFd) -> libc::pollfd {
    libc::pollfd {
        fd: evt.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }
}

fn readable(fd: &libc::pollfd) -> bool {
    fd.revents & libc::POLLIN != 0
}

/// Wait on `events` until `stop` is set, calling `on_fire` per source event
/// or elapsed `period`, and `on_eoi` per resample event.
fn service(
    events: &LineEvents,
    stop: &AtomicBool,
    period: Option<Duration>,
    on_fire: impl Fn(),
    on_eoi: impl Fn(),
) {
    let timeout = period.map_or(-1, |p| {
        i32::try_from(p.as_millis()).unwrap_or(i32::MAX).max(1)
    });
    let mut fds = [pollfd(&events.source), pollfd(&events.resample)];

    while !stop.load(Ordering::SeqCst) {
        for fd in &mut fds {
            fd.revents = 0;
        }
        // SAFETY: `fds` is a live array of `fds.len()` initialised pollfds.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(target: "irq", "irqfd worker poll failed: {err}");
            return;
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }

        if ready == 0 {
            on_fire();
            continue;
        }
        if readable(&fds[0]) && events.source.read().is_ok() {
            on_fire();
        }
        if readable(&fds[1]) && events.resample.read().is_ok() {
            on_eoi();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_service_routes_source_and_resample() {
        let events = LineEvents::new().unwrap();
        let stop = AtomicBool::new(false);
        let fired = AtomicUsize::new(0);
        let eois = AtomicUsize::new(0);

        std::thread::scope(|s| {
            s.spawn(|| {
                service(
                    &events,
                    &stop,
                    None,
                    || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                    || {
                        eois.fetch_add(1, Ordering::SeqCst);
                    },
                )
            });

            events.source.write(1).unwrap();
            wait_until("source event", || fired.load(Ordering::SeqCst) == 1);
            events.resample.write(1).unwrap();
            wait_until("resample event", || eois.load(Ordering::SeqCst) == 1);
            events.source.write(1).unwrap();
            wait_until("second source event", || fired.load(Ordering::SeqCst) == 2);

            stop.store(true, Ordering::SeqCst);
            events.source.write(1).unwrap();
        });

        // The wake-up write after stop is not a source event.
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(eois.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_fires_periodically() {
        let events = LineEvents::new().unwrap();
        let stop = AtomicBool::new(false);
        let fired = AtomicUsize::new(0);

        std::thread::scope(|s| {
            s.spawn(|| {
                service(
                    &events,
                    &stop,
                    Some(Duration::from_millis(1)),
                    || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                    || {},
                )
            });

            wait_until("periodic fire", || fired.load(Ordering::SeqCst) >= 3);
            stop.store(true, Ordering::SeqCst);
            events.source.write(1).unwrap();
        });
    }

    #[test]
    fn test_eoi_rearms_after_each_delivery() {
        // fire / EOI cycles as driven by the worker: every EOI re-arms.
        let mut latch = MaskLatch::default();
        for _ in 0..3 {
            assert!(latch.fire());
            assert!(!latch.fire());
            assert!(latch.unmask());
            assert!(!latch.unmask());
        }
    }

    #[test]
    fn test_fire_masks_until_unmask() {
        let mut latch = MaskLatch::default();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(!latch.fire());

        // One latched event, however many arrived.
        assert!(latch.unmask());
        assert!(!latch.unmask());
        assert!(latch.fire());
    }

    #[test]
    fn test_unmask_without_pending_rearms() {
        let mut latch = MaskLatch::default();
        assert!(latch.fire());
        assert!(!latch.unmask());
        assert_eq!(latch, MaskLatch::default());
    }

    #[test]
    fn test_vcpu_hold_defers_delivery() {
        let mut latch = MaskLatch::default();
        latch.hold();
        assert!(!latch.fire());
        assert!(!latch.unmask());
        assert!(latch.release());
        assert!(latch.masked);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut latch = MaskLatch::default();
        latch.fire();
        latch.fire();
        latch.clear();
        assert!(!latch.unmask());
    }
}
