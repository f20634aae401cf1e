//! Interrupt sinks: one interrupt source wired to one controller line.

use super::{EoiHandler, IrqController, VirqHandler};
use crate::error::SetupError;
use std::sync::Arc;

/// Level-triggered interrupt line.
///
/// Remembers whether the line is asserted and only tells the controller
/// about transitions, so repeated `inject()` or `ack()` calls are no-ops.
/// An unbound sink ignores everything.
///
/// Not `Clone`: two copies of a latched line would disagree about its state.
pub struct IrqSink {
    ic: Option<Arc<dyn IrqController>>,
    line: u32,
    asserted: bool,
}

impl IrqSink {
    /// An unbound sink.
    pub const fn new() -> Self {
        Self {
            ic: None,
            line: 0,
            asserted: false,
        }
    }

    pub fn bound(ic: Arc<dyn IrqController>, line: u32) -> Self {
        Self {
            ic: Some(ic),
            line,
            asserted: false,
        }
    }

    /// Deassert against the current binding, then switch to `ic`/`line`.
    pub fn rebind(&mut self, ic: Arc<dyn IrqController>, line: u32) {
        self.ack();

        self.ic = Some(ic);
        self.line = line;
    }

    pub fn inject(&mut self) {
        if self.asserted {
            return;
        }
        let Some(ic) = &self.ic else {
            return;
        };

        self.asserted = true;
        ic.set(self.line);
    }

    pub fn ack(&mut self) {
        if !self.asserted {
            return;
        }
        let Some(ic) = &self.ic else {
            return;
        };

        ic.clear(self.line);
        self.asserted = false;
    }

    /// Register `handler` for EOI notifications on this line.
    ///
    /// Does nothing while no controller is bound. The caller keeps the
    /// handler alive; the controller only holds a weak reference.
    pub fn set_eoi_handler(
        &self,
        handler: Option<&Arc<dyn EoiHandler>>,
    ) -> Result<(), SetupError> {
        match &self.ic {
            Some(ic) => ic.bind_eoi_handler(self.line, handler),
            None => Ok(()),
        }
    }

    /// Register `handler` as the direct-injection handler of this line.
    pub fn set_virq_handler(
        &self,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError> {
        match &self.ic {
            Some(ic) => ic.bind_virq_handler(self.line, handler),
            None => Ok(()),
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn controller(&self) -> Option<&Arc<dyn IrqController>> {
        self.ic.as_ref()
    }
}

impl Default for IrqSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Edge-triggered interrupt line.
///
/// Every `inject()` is a separate event for the controller; there is no
/// latched state and no `ack()`.
#[derive(Clone, Default)]
pub struct IrqEdgeSink {
    ic: Option<Arc<dyn IrqController>>,
    line: u32,
}

impl IrqEdgeSink {
    pub fn bound(ic: Arc<dyn IrqController>, line: u32) -> Self {
        Self { ic: Some(ic), line }
    }

    pub fn rebind(&mut self, ic: Arc<dyn IrqController>, line: u32) {
        self.ic = Some(ic);
        self.line = line;
    }

    pub fn inject(&self) {
        if let Some(ic) = &self.ic {
            ic.set(self.line);
        }
    }

    pub fn set_eoi_handler(
        &self,
        handler: Option<&Arc<dyn EoiHandler>>,
    ) -> Result<(), SetupError> {
        match &self.ic {
            Some(ic) => ic.bind_eoi_handler(self.line, handler),
            None => Ok(()),
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn controller(&self) -> Option<&Arc<dyn IrqController>> {
        self.ic.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::testing::{CountingHandler, IcEvent, IcLog, RecordingController};

    fn set(line: u32) -> IcEvent {
        IcEvent::Set { ic: 0, line }
    }

    fn clear(line: u32) -> IcEvent {
        IcEvent::Clear { ic: 0, line }
    }

    #[test]
    fn test_repeated_inject_sets_once() {
        let ic = RecordingController::new();
        let mut sink = IrqSink::bound(ic.clone(), 5);

        for _ in 0..10 {
            sink.inject();
        }

        assert_eq!(ic.events(), vec![set(5)]);
        assert!(sink.is_asserted());
    }

    #[test]
    fn test_inject_ack_inject() {
        let ic = RecordingController::new();
        let mut sink = IrqSink::bound(ic.clone(), 5);

        sink.inject();
        sink.ack();
        sink.inject();

        assert_eq!(ic.events(), vec![set(5), clear(5), set(5)]);
    }

    #[test]
    fn test_ack_while_clear_is_noop() {
        let ic = RecordingController::new();
        let mut sink = IrqSink::bound(ic.clone(), 5);

        sink.ack();
        sink.inject();
        sink.ack();
        sink.ack();

        assert_eq!(ic.events(), vec![set(5), clear(5)]);
    }

    #[test]
    fn test_unbound_sink_ignores_everything() {
        let mut sink = IrqSink::new();
        sink.inject();
        assert!(!sink.is_asserted());
        sink.ack();

        let handler: Arc<dyn EoiHandler> = CountingHandler::new();
        assert!(sink.set_eoi_handler(Some(&handler)).is_ok());
        assert!(sink.set_virq_handler(None).is_ok());
    }

    #[test]
    fn test_rebind_clears_old_binding_first() {
        let log = IcLog::default();
        let old = RecordingController::with_log(1, log.clone());
        let new = RecordingController::with_log(2, log.clone());

        let mut sink = IrqSink::bound(old, 7);
        sink.inject();
        sink.rebind(new, 9);
        assert!(!sink.is_asserted());
        sink.inject();

        assert_eq!(
            *log.lock(),
            vec![
                IcEvent::Set { ic: 1, line: 7 },
                IcEvent::Clear { ic: 1, line: 7 },
                IcEvent::Set { ic: 2, line: 9 },
            ]
        );
    }

    #[test]
    fn test_rebind_while_clear_touches_nothing() {
        let log = IcLog::default();
        let old = RecordingController::with_log(1, log.clone());
        let new = RecordingController::with_log(2, log.clone());

        let mut sink = IrqSink::bound(old, 7);
        sink.rebind(new.clone(), 9);

        assert!(log.lock().is_empty());
        assert_eq!(sink.line(), 9);
        let bound = sink.controller().unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(bound), Arc::as_ptr(&new)));
    }

    #[test]
    fn test_eoi_handler_registration() {
        let ic = RecordingController::new();
        let sink = IrqSink::bound(ic.clone(), 40);
        let counting = CountingHandler::new();
        let handler: Arc<dyn EoiHandler> = counting.clone();

        sink.set_eoi_handler(Some(&handler)).unwrap();
        assert!(ic.eoi_handler(40).is_some());

        assert!(ic.guest_eoi(40));
        assert_eq!(counting.eois(), 1);

        sink.set_eoi_handler(None).unwrap();
        assert!(ic.eoi_handler(40).is_none());
    }

    #[test]
    fn test_edge_sink_sets_every_time() {
        let ic = RecordingController::new();
        let sink = IrqEdgeSink::bound(ic.clone(), 3);

        for _ in 0..4 {
            sink.inject();
        }

        assert_eq!(ic.events(), vec![set(3); 4]);
    }

    #[test]
    fn test_edge_sink_rebind_has_no_clear() {
        let log = IcLog::default();
        let old = RecordingController::with_log(1, log.clone());
        let new = RecordingController::with_log(2, log.clone());

        let mut sink = IrqEdgeSink::default();
        sink.inject();
        sink.rebind(old, 4);
        sink.inject();
        sink.rebind(new, 6);
        sink.inject();

        assert_eq!(
            *log.lock(),
            vec![IcEvent::Set { ic: 1, line: 4 }, IcEvent::Set { ic: 2, line: 6 }]
        );
    }
}
