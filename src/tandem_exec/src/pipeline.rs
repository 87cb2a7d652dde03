//! The Pipeline Domain Interface.
//!
//! The executive never touches an interrupt controller, a timer chip, or
//! a thread directly. Everything machine- or host-specific is reached
//! through the trait family below, implemented by a *pipeline* crate
//! (`tandem_pipeline_std` for hosted Unix).
//!
//! The pipeline multiplexes one physical interrupt stream between two
//! *stages*: the **RT stage**, which sees every event first, and the
//! **GPOS stage**, to which unclaimed events are pended for deferred
//! delivery. Each stage has a per-CPU *stall bit*; stalling a stage defers
//! delivery to it without affecting the other stage.
use std::{boxed::Box, sync::Arc};

use crate::time::Count;

/// Number of interrupt vectors a pipeline exposes. Physical vectors grow
/// from 0; virtual IRQs are allocated from the top.
pub const NUM_VECTORS: usize = 1024;

/// Number of CPU-exception vectors routed through the trap catcher.
pub const NUM_TRAPS: usize = 32;

/// An interrupt vector number, physical or virtual.
pub type IrqVec = usize;

/// Identifies an execution context managed by the pipeline (a task's
/// machine context; on a hosted pipeline, a worker thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtxId(pub usize);

/// Identifies a registered domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainId(pub usize);

/// The two stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rt,
    Gpos,
}

/// Opaque snapshot of interrupt state returned by
/// [`PipelineDomain::critical_enter`].
#[derive(Debug)]
#[must_use]
pub struct CriticalFlags(pub usize);

/// What a trap catcher decided about a CPU exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDisposition {
    /// The RT domain consumed the event.
    Handled,
    /// Propagate the event downstream to the GPOS.
    Propagate,
}

/// A GPOS lifecycle event delivered to the RT domain's event catcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum GposEvent {
    /// A signal is about to be delivered to the GPOS twin behind `ctx`.
    Signal { ctx: CtxId, signo: i32 },
    /// The GPOS thread behind `ctx` is exiting.
    ProcessExit { ctx: CtxId },
    /// The GPOS rescheduled priorities under `ctx`.
    Renice { ctx: CtxId, prio: i32 },
}

/// Opaque FPU save area. The pipeline defines its actual contents; the
/// executive only moves it around whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct FpuArea(pub u64);

/// The RT domain's entry points, registered once at bring-up.
///
/// Entries hold `Weak` references back into the executive in practice;
/// the pipeline just calls them.
#[derive(Clone)]
pub struct DomainHooks {
    pub name: &'static str,
    /// Called on the RT stage for every interrupt, physical or virtual.
    pub irq: Arc<dyn Fn(usize, IrqVec) + Send + Sync>,
    /// Called for every CPU exception taken while the RT domain is
    /// active. The return value decides downstream propagation.
    pub trap: Arc<dyn Fn(usize, usize) -> TrapDisposition + Send + Sync>,
    /// Called for GPOS lifecycle events the domain subscribed to.
    pub event: Arc<dyn Fn(GposEvent) + Send + Sync>,
}

/// A GPOS-stage interrupt handler (the "stock" handler a device driver or
/// the executive registers alongside the GPOS kernel).
pub type GposHandler = Arc<dyn Fn() + Send + Sync>;

/// A task body handed to [`PipelineContexts::reserve_context`].
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Errors reported by pipeline implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    BadVector,
    Busy,
    Exhausted,
}

/// Domain registration, IRQ routing, stages and critical sections.
///
/// # Safety
///
/// An implementation must deliver each posted interrupt exactly once to
/// the registered domain entry, must honor stall bits (no delivery to a
/// stalled stage until it is unstalled), and must make
/// [`critical_enter`](Self::critical_enter) exclude concurrent delivery
/// on every CPU.
pub unsafe trait PipelineDomain: Send + Sync + 'static {
    /// Number of logical CPUs the pipeline schedules over.
    fn num_cpus(&self) -> usize;

    /// The CPU the calling thread is bound to, for interrupt bookkeeping.
    fn current_cpu(&self) -> usize;

    /// Register the RT domain. Grabs every vector: from return onward the
    /// `irq` hook sees each interrupt first, and the `trap` hook sees
    /// every CPU exception.
    fn register_domain(&self, hooks: DomainHooks) -> Result<DomainId, PipelineError>;

    /// Reverse of [`register_domain`](Self::register_domain); blocks until
    /// in-flight deliveries have drained.
    fn unregister_domain(&self, id: DomainId);

    /// Allocate a virtual IRQ vector for software-triggered events.
    fn alloc_virq(&self) -> Result<IrqVec, PipelineError>;

    fn free_virq(&self, vec: IrqVec);

    /// Trigger a vector on a CPU as if the hardware had raised it.
    fn post_virq(&self, cpu: usize, vec: IrqVec);

    /// Mark `vec` pending on the GPOS stage without invoking any handler
    /// now. It plays when the stage is synchronized.
    fn pend_to_gpos(&self, vec: IrqVec);

    /// Install a GPOS-stage handler for `vec`, sharing the vector with
    /// whatever the GPOS already has there.
    fn register_gpos_handler(&self, vec: IrqVec, handler: GposHandler)
        -> Result<(), PipelineError>;

    fn unregister_gpos_handler(&self, vec: IrqVec);

    /// Let the GPOS stage of `cpu` play out its pended vectors, unless it
    /// is stalled.
    fn sync_gpos_stage(&self, cpu: usize);

    /// Set the stall bit of a stage on one CPU. Returns the previous
    /// value. Transitions are atomic exchanges.
    fn stall(&self, stage: Stage, cpu: usize) -> bool;

    fn unstall(&self, stage: Stage, cpu: usize);

    fn is_stalled(&self, stage: Stage, cpu: usize) -> bool;

    /// Stall every CPU's RT stage and return the previous global state.
    /// Used around multi-word updates that interrupt handlers may read.
    fn critical_enter(&self) -> CriticalFlags;

    fn critical_exit(&self, flags: CriticalFlags);

    /// Restrict delivery of `vec` to the CPUs in `mask`.
    fn set_irq_affinity(&self, vec: IrqVec, mask: u64) -> Result<(), PipelineError>;

    // Interrupt-controller surface. Thin pass-throughs to the stock GPOS
    // controller code; the executive wraps them with stage locking.

    fn pic_startup(&self, vec: IrqVec);
    fn pic_shutdown(&self, vec: IrqVec);
    fn pic_enable(&self, vec: IrqVec);
    fn pic_disable(&self, vec: IrqVec);
    fn pic_mask_ack(&self, vec: IrqVec);
    fn pic_unmask(&self, vec: IrqVec);
    fn pic_ack(&self, vec: IrqVec);
}

/// Execution contexts: creation, switching and the reservoir.
///
/// Resumption follows **counted-token park semantics**: every
/// [`resume`](Self::resume) deposits one run token; every
/// [`park_current`](Self::park_current) consumes one, blocking until one
/// is available. [`remote_park`](Self::remote_park) forces another
/// context to consume a token as if it had parked itself.
///
/// # Safety
///
/// Tokens must never be lost: a resume posted before the target parks
/// must satisfy that park. The executive's context switching is built
/// entirely on this guarantee.
pub unsafe trait PipelineContexts: Send + Sync {
    /// Draw a context from the reservoir and aim it at `entry`. The
    /// context starts parked; the first [`resume`](Self::resume) runs it.
    fn reserve_context(
        &self,
        cpu: usize,
        stack_size: usize,
        entry: TaskEntry,
    ) -> Result<CtxId, PipelineError>;

    /// Register the calling GPOS thread as a context (the *twin* of a
    /// soft task).
    fn adopt_current(&self) -> CtxId;

    /// Undo [`adopt_current`](Self::adopt_current).
    fn release_adopted(&self, ctx: CtxId);

    /// Deposit a run token for `ctx`.
    fn resume(&self, ctx: CtxId);

    /// Consume a run token, blocking until one is available.
    fn park_current(&self);

    /// Force `ctx` to park as if it had called
    /// [`park_current`](Self::park_current). No-op if it is already
    /// parked.
    fn remote_park(&self, ctx: CtxId);

    /// Terminate the current reserved context without returning through
    /// its body; the context goes back to the reservoir.
    fn exit_current(&self) -> !;

    /// The context of the calling thread, if it is one.
    fn current(&self) -> Option<CtxId>;

    /// Spawn a plain GPOS-side service thread (gatekeepers and friends).
    fn spawn_gpos_worker(&self, name: &str, body: Box<dyn FnOnce() + Send>);
}

/// Clocks and the hardware timer.
///
/// # Safety
///
/// Counter reads must be monotonic per CPU, and a programmed shot must
/// raise the vector passed to [`grab_timer`](Self::grab_timer).
pub unsafe trait PipelineTimer: Send + Sync {
    /// CPU time-stamp counter frequency in Hz.
    fn cpu_freq(&self) -> u64;

    /// Hardware timer frequency in Hz.
    fn timer_freq(&self) -> u64;

    /// The GPOS tick latch: the period, in timer counts, at which the
    /// GPOS expects its own tick.
    fn gpos_tick_latch(&self) -> Count;

    /// Read the free-running CPU counter.
    fn read_cpu_counts(&self) -> Count;

    /// Take over the hardware timer. `periodic` programs a fixed-interval
    /// tick of that many timer counts; `None` selects one-shot operation
    /// (arm with [`program_shot`](Self::program_shot)).
    fn grab_timer(&self, vec: IrqVec, periodic: Option<Count>) -> Result<(), PipelineError>;

    /// Arm the next one-shot expiry `delay` timer counts from now.
    fn program_shot(&self, delay: Count);

    /// Release the timer back to the GPOS and restore its natural tick.
    fn release_timer(&self);
}

/// The floating-point unit.
///
/// # Safety
///
/// `fpu_save` followed by `fpu_restore` of the same area must reproduce
/// the FPU state observed by the context running on `cpu`.
pub unsafe trait PipelineFpu: Send + Sync {
    fn fpu_save(&self, cpu: usize, area: &mut FpuArea);

    fn fpu_restore(&self, cpu: usize, area: &FpuArea);

    /// The "FPU disabled" trap bit (CR0.TS analog) of `cpu`.
    fn fpu_disable_bit(&self, cpu: usize) -> bool;

    fn set_fpu_disable_bit(&self, cpu: usize, on: bool);
}

/// The complete Pipeline Domain Interface.
pub trait Pipeline: PipelineDomain + PipelineContexts + PipelineTimer + PipelineFpu {}

impl<T: PipelineDomain + PipelineContexts + PipelineTimer + PipelineFpu> Pipeline for T {}
