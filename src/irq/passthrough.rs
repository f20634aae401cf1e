//! Hardware interrupt passthrough.
//!
//! A [`HwIrqPassthrough`] owns one physical interrupt and forwards it to a
//! controller line. The physical interrupt is bound to the vCPU for direct
//! injection; the device also registers itself as the line's virq handler so
//! the controller can mask, unmask and acknowledge it.

use super::{EoiHandler, IrqController, IrqSink, VcpuId, VirqHandler};
use crate::error::SetupError;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a physical interrupt capability.
#[derive(Error, Debug)]
pub enum HwIrqError {
    /// Creating the interrupt object failed.
    #[error("failed to create interrupt object: {0}")]
    Create(#[source] std::io::Error),

    /// Routing the interrupt into a vCPU failed.
    #[error("failed to route interrupt to line {line}: {source}")]
    Bind {
        line: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Capability to a physical interrupt.
///
/// Only [`HwIrq::bind_vcpu`] reports errors. The remaining operations are
/// masking and trigger plumbing whose failures the implementation handles
/// itself.
pub trait HwIrq: Send + Sync {
    /// Deliver this interrupt straight into `vcpu` as `line`.
    fn bind_vcpu(&self, vcpu: VcpuId, line: u32) -> Result<(), HwIrqError>;

    /// Undo [`HwIrq::bind_vcpu`].
    fn detach(&self);

    /// Re-arm the interrupt after it fired.
    fn unmask(&self);

    fn set_priority(&self, prio: u32);

    /// Allow delivery into the bound vCPU.
    fn unmask_vcpu(&self);

    /// Hold back delivery into the bound vCPU.
    fn mask_vcpu(&self);

    /// Mark the interrupt pending.
    fn trigger(&self);

    /// Drop a pending interrupt.
    fn clear_vcpu(&self);
}

/// Passthrough of one physical interrupt to one controller line.
pub struct HwIrqPassthrough<H> {
    irq: Mutex<IrqSink>,
    hw_irq: H,
}

impl<H: HwIrq + 'static> HwIrqPassthrough<H> {
    /// Wire `hw_irq` to `line` of `ic` with direct injection into `vcpu`.
    ///
    /// Fails if `line` already has a handler, or if the physical interrupt
    /// cannot be bound to the vCPU. The controller only keeps a weak
    /// reference: dropping the returned `Arc` unbinds the line.
    pub fn new(
        vcpu: VcpuId,
        hw_irq: H,
        ic: Arc<dyn IrqController>,
        line: u32,
    ) -> Result<Arc<Self>, SetupError> {
        if ic.eoi_handler(line).is_some() {
            return Err(SetupError::HandlerAlreadyBound { line });
        }

        let mut irq = IrqSink::new();
        irq.rebind(ic, line);

        hw_irq
            .bind_vcpu(vcpu, line)
            .map_err(|source| SetupError::BindVcpu { line, source })?;

        let dev = Arc::new(Self {
            irq: Mutex::new(irq),
            hw_irq,
        });

        let handler: Arc<dyn VirqHandler> = dev.clone();
        dev.irq.lock().set_virq_handler(Some(&handler))?;

        tracing::info!(target: "irq", line, %vcpu, "hardware irq passthrough bound");
        Ok(dev)
    }

    /// Software delivery path: assert the line at the controller.
    pub fn handle_irq(&self) {
        self.irq.lock().inject();
    }

    /// Remove this device's handler registration from the controller.
    pub fn unregister(&self) -> Result<(), SetupError> {
        self.irq.lock().set_virq_handler(None)
    }

    pub fn line(&self) -> u32 {
        self.irq.lock().line()
    }

    pub fn hw_irq(&self) -> &H {
        &self.hw_irq
    }
}

impl<H: HwIrq> EoiHandler for HwIrqPassthrough<H> {
    fn eoi(&self) {
        self.irq.lock().ack();
        self.hw_irq.unmask();
    }

    fn set_priority(&self, prio: u32) {
        self.hw_irq.set_priority(prio);
    }
}

impl<H: HwIrq> VirqHandler for HwIrqPassthrough<H> {
    fn bind(&self, vcpu: VcpuId, cfg: u32) -> Result<(), SetupError> {
        self.hw_irq
            .bind_vcpu(vcpu, cfg)
            .map_err(|source| SetupError::BindVcpu { line: cfg, source })
    }

    fn unbind(&self) {
        self.hw_irq.detach();
    }

    fn enable(&self) {
        self.hw_irq.unmask_vcpu();
    }

    fn disable(&self) {
        self.hw_irq.mask_vcpu();
    }

    fn set_pending(&self) {
        self.hw_irq.trigger();
    }

    fn clear_pending(&self) {
        self.hw_irq.clear_vcpu();
    }
}
