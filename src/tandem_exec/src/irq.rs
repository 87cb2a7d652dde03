//! The dual-domain IRQ dispatch table.
//!
//! Every vector arrives in the RT domain first. A vector with a
//! real-time handler installed is acknowledged and handled on the spot
//! (on the stack of whatever was interrupted, so handlers must be short
//! and must not block); anything else is pended downstream to the GPOS
//! stage for deferred delivery. Handlers are closures, which subsume the
//! `cookie` argument of the source material.
//!
//! Service requests (SRQs) multiplex small GPOS-side callbacks over one
//! virtual IRQ: real-time code pends an SRQ, and the callback runs the
//! next time the GPOS stage synchronizes.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{
    error::IrqError,
    exec::Executive,
    pipeline::{IrqVec, Pipeline, Stage, NUM_VECTORS},
};

/// A registered real-time interrupt handler. The return value is
/// meaningful only for handlers installed with `retmode`: `true` claims
/// the interrupt, skipping downstream propagation.
pub type IrqHandler = Arc<dyn Fn(IrqVec) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) struct IrqSlot {
    handler: IrqHandler,
    retmode: bool,
}

/// The per-vector RT handler table.
pub(crate) struct IrqTable {
    slots: spin::Mutex<Vec<Option<IrqSlot>>>,
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new((0..NUM_VECTORS).map(|_| None).collect()),
        }
    }

    fn get(&self, vec: IrqVec) -> Option<IrqSlot> {
        self.slots.lock().get(vec)?.clone()
    }
}

/// The GPOS-side service-request registry.
pub(crate) struct SrqTable {
    slots: Vec<Option<Arc<dyn Fn() + Send + Sync>>>,
    pending: u64,
}

/// SRQ identifiers are small indices; the first two are reserved like
/// the source reserves them for internal use.
const NUM_SRQS: usize = 64;
const FIRST_FREE_SRQ: usize = 2;

impl SrqTable {
    pub fn new() -> Self {
        Self {
            slots: (0..NUM_SRQS).map(|_| None).collect(),
            pending: 0,
        }
    }
}

impl<P: Pipeline> Executive<P> {
    // -----------------------------------------------------------------
    // RT handler table

    /// Install a real-time handler for `vec`. Fails with `Busy` if the
    /// slot is occupied. With `retmode`, a handler returning `true`
    /// claims the interrupt and nothing is propagated downstream;
    /// otherwise the vector is also pended to the GPOS stage so a GPOS
    /// driver sharing it still runs.
    pub fn request_irq<F>(&self, vec: IrqVec, retmode: bool, handler: F) -> Result<(), IrqError>
    where
        F: Fn(IrqVec) -> bool + Send + Sync + 'static,
    {
        if vec >= NUM_VECTORS {
            return Err(IrqError::BadParam);
        }
        let flags = self.pipeline.critical_enter();
        let mut slots = self.irqs.slots.lock();
        if slots[vec].is_some() {
            drop(slots);
            self.pipeline.critical_exit(flags);
            return Err(IrqError::Busy);
        }
        slots[vec] = Some(IrqSlot {
            handler: Arc::new(handler),
            retmode,
        });
        drop(slots);
        self.pipeline.critical_exit(flags);
        Ok(())
    }

    /// Remove the real-time handler of `vec`.
    pub fn release_irq(&self, vec: IrqVec) {
        if vec < NUM_VECTORS {
            self.irqs.slots.lock()[vec] = None;
        }
    }

    /// Install a GPOS-stage handler for `vec`, sharing the vector with
    /// the GPOS's own drivers.
    pub fn request_gpos_irq(
        &self,
        vec: IrqVec,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), IrqError> {
        self.pipeline
            .register_gpos_handler(vec, handler)
            .map_err(|_| IrqError::Busy)
    }

    pub fn release_gpos_irq(&self, vec: IrqVec) {
        self.pipeline.unregister_gpos_handler(vec);
    }

    /// Mark `vec` pending on the GPOS stage without running anything
    /// now.
    pub fn pend_to_gpos(&self, vec: IrqVec) {
        self.pipeline.pend_to_gpos(vec);
    }

    /// The RT-domain entry for one interrupt. Invoked by the pipeline on
    /// the dispatching CPU.
    pub(crate) fn dispatch_irq(&self, cpu: usize, vec: IrqVec) {
        self.pipeline.pic_ack(vec);
        let slot = self.irqs.get(vec);
        match slot {
            Some(slot) => {
                {
                    let mut g = self.lock();
                    g.cpus[cpu].isr_nesting += 1;
                }
                let claimed = (slot.handler)(vec);
                let deferred = {
                    let mut g = self.lock();
                    g.cpus[cpu].isr_nesting -= 1;
                    let run_now = g.cpus[cpu].isr_nesting == 0 && g.cpus[cpu].deferred_resched;
                    if run_now {
                        g.cpus[cpu].deferred_resched = false;
                    }
                    run_now
                };
                if !(slot.retmode && claimed) {
                    // Shared with a GPOS driver: let its half run too.
                    self.pipeline.pend_to_gpos(vec);
                }
                if deferred {
                    // Wake-ups from the handler coalesce into one switch
                    // here, at outermost dispatch exit.
                    self.rt_schedule();
                }
            }
            None => self.pipeline.pend_to_gpos(vec),
        }
        // If the GPOS placeholder is (still) current and its stage is
        // open, let what we just pended play out.
        let sync = {
            let g = self.lock();
            g.cpus[cpu].current == g.cpus[cpu].gpos
        };
        if sync && !self.pipeline.is_stalled(Stage::Gpos, cpu) {
            self.pipeline.sync_gpos_stage(cpu);
        }
    }

    // -----------------------------------------------------------------
    // Interrupt-controller surface

    /// Start and initialize the controller for `vec`.
    pub fn startup_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_startup(vec))
    }

    /// Shut the source down; no further requests are accepted.
    pub fn shutdown_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_shutdown(vec))
    }

    pub fn enable_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_enable(vec))
    }

    pub fn disable_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_disable(vec))
    }

    /// Mask and acknowledge a level-triggered source.
    pub fn mask_ack_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_mask_ack(vec))
    }

    pub fn unmask_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_unmask(vec))
    }

    pub fn ack_irq(&self, vec: IrqVec) -> Result<(), IrqError> {
        self.pic_op(vec, |p| p.pic_ack(vec))
    }

    /// Restrict delivery of `vec` to the CPUs in `mask`.
    pub fn assign_irq_to_cpu(&self, vec: IrqVec, mask: u64) -> Result<(), IrqError> {
        if vec >= NUM_VECTORS {
            return Err(IrqError::BadParam);
        }
        self.pipeline
            .set_irq_affinity(vec, mask)
            .map_err(|_| IrqError::BadParam)
    }

    /// Controller mutation bracket: the stock GPOS controller code runs
    /// with every stage quiesced.
    fn pic_op(&self, vec: IrqVec, op: impl FnOnce(&P)) -> Result<(), IrqError> {
        if vec >= NUM_VECTORS {
            return Err(IrqError::BadParam);
        }
        let flags = self.pipeline.critical_enter();
        op(&self.pipeline);
        self.pipeline.critical_exit(flags);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Service requests

    /// Register a GPOS-side callback and get its SRQ id.
    pub fn request_srq(
        &self,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<usize, IrqError> {
        let mut srqs = self.srqs.lock();
        for id in FIRST_FREE_SRQ..NUM_SRQS {
            if srqs.slots[id].is_none() {
                srqs.slots[id] = Some(handler);
                return Ok(id);
            }
        }
        Err(IrqError::Busy)
    }

    pub fn free_srq(&self, id: usize) -> Result<(), IrqError> {
        let mut srqs = self.srqs.lock();
        if id < FIRST_FREE_SRQ || id >= NUM_SRQS || srqs.slots[id].is_none() {
            return Err(IrqError::BadParam);
        }
        srqs.slots[id] = None;
        srqs.pending &= !(1 << id);
        Ok(())
    }

    /// Pend an SRQ from real-time context; its handler runs at the next
    /// GPOS-stage synchronization.
    pub fn pend_srq(&self, id: usize) -> Result<(), IrqError> {
        {
            let mut srqs = self.srqs.lock();
            if id >= NUM_SRQS || srqs.slots[id].is_none() {
                return Err(IrqError::BadParam);
            }
            srqs.pending |= 1 << id;
        }
        self.pipeline
            .pend_to_gpos(self.srq_virq.load(Ordering::Acquire));
        Ok(())
    }

    /// Drain pended SRQs. Runs on the GPOS stage.
    pub(crate) fn run_pending_srqs(&self) {
        loop {
            let (id, handler) = {
                let mut srqs = self.srqs.lock();
                if srqs.pending == 0 {
                    return;
                }
                let id = srqs.pending.trailing_zeros() as usize;
                srqs.pending &= !(1 << id);
                match &srqs.slots[id] {
                    Some(h) => (id, Arc::clone(h)),
                    None => continue,
                }
            };
            log::trace!("srq {id} fires");
            handler();
        }
    }
}
