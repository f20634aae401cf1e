//! Line-number keyed handler registry.
//!
//! Controllers embed a [`LineTable`] to implement the binding half of
//! [`IrqController`](super::IrqController). Lines `0..local` are CPU-local,
//! the rest are shared between vCPUs.

use super::{EoiHandler, VirqHandler};
use crate::error::SetupError;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

enum Binding {
    Eoi(Weak<dyn EoiHandler>),
    Virq(Weak<dyn VirqHandler>),
}

impl Binding {
    fn eoi_handler(&self) -> Option<Arc<dyn EoiHandler>> {
        match self {
            Binding::Eoi(h) => h.upgrade(),
            Binding::Virq(h) => h.upgrade().map(|h| h as Arc<dyn EoiHandler>),
        }
    }

    fn virq_handler(&self) -> Option<Arc<dyn VirqHandler>> {
        match self {
            Binding::Eoi(_) => None,
            Binding::Virq(h) => h.upgrade(),
        }
    }
}

/// Registry of EOI and virq handlers, one slot per line.
pub struct LineTable {
    local: u32,
    slots: Mutex<Vec<Option<Binding>>>,
}

impl LineTable {
    /// Table with `local` CPU-local lines followed by `shared` shared lines.
    pub fn new(local: u32, shared: u32) -> Self {
        let lines = local + shared;
        Self {
            local,
            slots: Mutex::new((0..lines).map(|_| None).collect()),
        }
    }

    /// Total number of lines.
    pub fn lines(&self) -> u32 {
        self.slots.lock().len() as u32
    }

    pub fn is_local(&self, line: u32) -> bool {
        line < self.local
    }

    pub fn bind_eoi(
        &self,
        line: u32,
        handler: Option<&Arc<dyn EoiHandler>>,
    ) -> Result<(), SetupError> {
        let binding = handler.map(|h| {
            let ptr = Arc::as_ptr(h) as *const ();
            (ptr, Binding::Eoi(Arc::downgrade(h)))
        });
        self.bind(line, binding)
    }

    pub fn bind_virq(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError> {
        let binding = handler.map(|h| {
            let ptr = Arc::as_ptr(h) as *const ();
            (ptr, Binding::Virq(Arc::downgrade(h)))
        });
        self.bind(line, binding)
    }

    /// Bind a virq handler to a CPU-local line.
    pub fn bind_local_virq(
        &self,
        line: u32,
        handler: Option<&Arc<dyn VirqHandler>>,
    ) -> Result<(), SetupError> {
        if !self.is_local(line) {
            return Err(SetupError::NotCpuLocal {
                line,
                local: self.local,
            });
        }
        self.bind_virq(line, handler)
    }

    fn bind(&self, line: u32, binding: Option<(*const (), Binding)>) -> Result<(), SetupError> {
        let mut slots = self.slots.lock();
        let lines = slots.len() as u32;
        let slot = slots
            .get_mut(line as usize)
            .ok_or(SetupError::LineOutOfRange { line, lines })?;

        let Some((ptr, binding)) = binding else {
            *slot = None;
            return Ok(());
        };

        match slot.as_ref().and_then(Binding::eoi_handler) {
            Some(current) if !std::ptr::addr_eq(Arc::as_ptr(&current), ptr) => {
                return Err(SetupError::HandlerAlreadyBound { line });
            }
            // Same object again: an EOI binding must not demote its virq binding.
            Some(_) if matches!(binding, Binding::Eoi(_)) => {}
            _ => *slot = Some(binding),
        }

        Ok(())
    }

    fn with_slot<T>(&self, line: u32, f: impl FnOnce(&Binding) -> Option<T>) -> Option<T> {
        let slots = self.slots.lock();
        slots.get(line as usize)?.as_ref().and_then(f)
    }

    /// The live handler bound to `line`, either as EOI or virq handler.
    pub fn eoi_handler(&self, line: u32) -> Option<Arc<dyn EoiHandler>> {
        self.with_slot(line, Binding::eoi_handler)
    }

    /// The live virq handler bound to `line`.
    pub fn virq_handler(&self, line: u32) -> Option<Arc<dyn VirqHandler>> {
        self.with_slot(line, Binding::virq_handler)
    }

    /// Deliver the guest's EOI for `line` to its handler.
    ///
    /// Returns `false` if no live handler is bound. The handler runs
    /// without the table lock held, so it may call back into the
    /// controller.
    pub fn eoi(&self, line: u32) -> bool {
        match self.eoi_handler(line) {
            Some(handler) => {
                handler.eoi();
                true
            }
            None => false,
        }
    }

    /// Forward a priority change on `line` to its handler.
    pub fn set_priority(&self, line: u32, prio: u32) {
        if let Some(handler) = self.eoi_handler(line) {
            handler.set_priority(prio);
        }
    }
}
