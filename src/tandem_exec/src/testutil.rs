//! A minimal in-process pipeline for unit tests.
//!
//! `MockPipeline` satisfies the whole Pipeline Domain Interface without
//! spawning a single thread: contexts are numbered, park/resume are
//! recorded rather than performed, and the clock is a counter the test
//! advances by hand. Unit tests drive the executive's state machinery
//! through it; anything that genuinely needs to block runs in the
//! hosted pipeline's integration tests instead.
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::{
    exec::{Config, Executive},
    pipeline::{
        CriticalFlags, CtxId, DomainHooks, DomainId, FpuArea, GposHandler, IrqVec, PipelineError,
        Stage, TaskEntry,
    },
    task::TaskOptions,
};

thread_local! {
    static CURRENT_CTX: Cell<Option<usize>> = Cell::new(None);
}

#[derive(Default)]
pub(crate) struct MockLog {
    pub resumes: Vec<usize>,
    pub parks: usize,
    pub remote_parks: Vec<usize>,
    pub programmed: Vec<i64>,
    pub pended_gpos: Vec<usize>,
}

pub(crate) struct MockPipeline {
    ncpus: usize,
    next_ctx: AtomicUsize,
    now: AtomicI64,
    pub log: SpinMutex<MockLog>,
    hooks: SpinMutex<Option<DomainHooks>>,
    gpos_handlers: SpinMutex<Vec<(IrqVec, GposHandler)>>,
    fpu: Vec<AtomicI64>,
    fpu_disable: Vec<AtomicUsize>,
    stalled: Vec<[AtomicUsize; 2]>,
}

impl MockPipeline {
    pub fn new(ncpus: usize) -> Self {
        Self {
            ncpus,
            next_ctx: AtomicUsize::new(1),
            now: AtomicI64::new(1_000),
            log: SpinMutex::new(MockLog::default()),
            hooks: SpinMutex::new(None),
            gpos_handlers: SpinMutex::new(Vec::new()),
            fpu: (0..ncpus).map(|_| AtomicI64::new(0)).collect(),
            fpu_disable: (0..ncpus).map(|_| AtomicUsize::new(0)).collect(),
            stalled: (0..ncpus).map(|_| [AtomicUsize::new(0), AtomicUsize::new(0)]).collect(),
        }
    }

    /// Pretend the calling thread is context `ctx`.
    pub fn set_current(ctx: Option<CtxId>) {
        CURRENT_CTX.with(|c| c.set(ctx.map(|c| c.0)));
    }

    /// Advance the fake clock.
    pub fn advance(&self, counts: i64) {
        self.now.fetch_add(counts, Ordering::Relaxed);
    }

    fn stage_ix(stage: Stage) -> usize {
        match stage {
            Stage::Rt => 0,
            Stage::Gpos => 1,
        }
    }
}

unsafe impl crate::pipeline::PipelineDomain for MockPipeline {
    fn num_cpus(&self) -> usize {
        self.ncpus
    }

    fn current_cpu(&self) -> usize {
        0
    }

    fn register_domain(&self, hooks: DomainHooks) -> Result<DomainId, PipelineError> {
        *self.hooks.lock() = Some(hooks);
        Ok(DomainId(1))
    }

    fn unregister_domain(&self, _id: DomainId) {
        *self.hooks.lock() = None;
    }

    fn alloc_virq(&self) -> Result<IrqVec, PipelineError> {
        Ok(1000 + self.next_ctx.fetch_add(1, Ordering::Relaxed))
    }

    fn free_virq(&self, _vec: IrqVec) {}

    fn post_virq(&self, cpu: usize, vec: IrqVec) {
        let hooks = self.hooks.lock().clone();
        if let Some(h) = hooks {
            (h.irq)(cpu, vec);
        }
    }

    fn pend_to_gpos(&self, vec: IrqVec) {
        self.log.lock().pended_gpos.push(vec);
    }

    fn register_gpos_handler(
        &self,
        vec: IrqVec,
        handler: GposHandler,
    ) -> Result<(), PipelineError> {
        self.gpos_handlers.lock().push((vec, handler));
        Ok(())
    }

    fn unregister_gpos_handler(&self, vec: IrqVec) {
        self.gpos_handlers.lock().retain(|(v, _)| *v != vec);
    }

    fn sync_gpos_stage(&self, _cpu: usize) {}

    fn stall(&self, stage: Stage, cpu: usize) -> bool {
        self.stalled[cpu][Self::stage_ix(stage)].swap(1, Ordering::AcqRel) != 0
    }

    fn unstall(&self, stage: Stage, cpu: usize) {
        self.stalled[cpu][Self::stage_ix(stage)].store(0, Ordering::Release);
    }

    fn is_stalled(&self, stage: Stage, cpu: usize) -> bool {
        self.stalled[cpu][Self::stage_ix(stage)].load(Ordering::Acquire) != 0
    }

    fn critical_enter(&self) -> CriticalFlags {
        CriticalFlags(0)
    }

    fn critical_exit(&self, _flags: CriticalFlags) {}

    fn set_irq_affinity(&self, _vec: IrqVec, _mask: u64) -> Result<(), PipelineError> {
        Ok(())
    }

    fn pic_startup(&self, _vec: IrqVec) {}
    fn pic_shutdown(&self, _vec: IrqVec) {}
    fn pic_enable(&self, _vec: IrqVec) {}
    fn pic_disable(&self, _vec: IrqVec) {}
    fn pic_mask_ack(&self, _vec: IrqVec) {}
    fn pic_unmask(&self, _vec: IrqVec) {}
    fn pic_ack(&self, _vec: IrqVec) {}
}

unsafe impl crate::pipeline::PipelineContexts for MockPipeline {
    fn reserve_context(
        &self,
        _cpu: usize,
        _stack_size: usize,
        _entry: TaskEntry,
    ) -> Result<CtxId, PipelineError> {
        Ok(CtxId(self.next_ctx.fetch_add(1, Ordering::Relaxed)))
    }

    fn adopt_current(&self) -> CtxId {
        let id = CtxId(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        Self::set_current(Some(id));
        id
    }

    fn release_adopted(&self, _ctx: CtxId) {
        Self::set_current(None);
    }

    fn resume(&self, ctx: CtxId) {
        self.log.lock().resumes.push(ctx.0);
    }

    fn park_current(&self) {
        self.log.lock().parks += 1;
    }

    fn remote_park(&self, ctx: CtxId) {
        self.log.lock().remote_parks.push(ctx.0);
    }

    fn exit_current(&self) -> ! {
        panic!("exit_current in a mock test");
    }

    fn current(&self) -> Option<CtxId> {
        CURRENT_CTX.with(|c| c.get()).map(CtxId)
    }

    fn spawn_gpos_worker(&self, _name: &str, _body: Box<dyn FnOnce() + Send>) {
        // Unit tests have no gatekeepers running.
    }
}

unsafe impl crate::pipeline::PipelineTimer for MockPipeline {
    fn cpu_freq(&self) -> u64 {
        1_000_000_000
    }

    fn timer_freq(&self) -> u64 {
        1_000_000_000
    }

    fn gpos_tick_latch(&self) -> i64 {
        10_000_000
    }

    fn read_cpu_counts(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    fn grab_timer(&self, _vec: IrqVec, _periodic: Option<i64>) -> Result<(), PipelineError> {
        Ok(())
    }

    fn program_shot(&self, delay: i64) {
        self.log.lock().programmed.push(delay);
    }

    fn release_timer(&self) {}
}

unsafe impl crate::pipeline::PipelineFpu for MockPipeline {
    fn fpu_save(&self, cpu: usize, area: &mut FpuArea) {
        area.0 = self.fpu[cpu].load(Ordering::Relaxed) as u64;
    }

    fn fpu_restore(&self, cpu: usize, area: &FpuArea) {
        self.fpu[cpu].store(area.0 as i64, Ordering::Relaxed);
    }

    fn fpu_disable_bit(&self, cpu: usize) -> bool {
        self.fpu_disable[cpu].load(Ordering::Relaxed) != 0
    }

    fn set_fpu_disable_bit(&self, cpu: usize, on: bool) {
        self.fpu_disable[cpu].store(on as usize, Ordering::Relaxed);
    }
}

/// An executive over a fresh mock pipeline.
pub(crate) fn mock_exec(ncpus: usize) -> Arc<Executive<MockPipeline>> {
    let _ = env_logger::builder().is_test(true).try_init();
    Executive::start(MockPipeline::new(ncpus), Config::default())
}

/// Run `f` with the calling thread registered as a freshly created task
/// (so operations that need a task context work), then unregister.
pub(crate) fn with_task_context<R>(
    exec: &Arc<Executive<MockPipeline>>,
    f: impl FnOnce(&Arc<Executive<MockPipeline>>) -> R,
) -> R {
    let id = exec
        .task_init(8, TaskOptions::default(), |_, _| {})
        .expect("context task");
    let ctx = {
        let g = exec.lock();
        g.tcb(id).expect("fresh task").ctx.expect("pooled ctx")
    };
    MockPipeline::set_current(Some(ctx));
    let r = f(exec);
    MockPipeline::set_current(None);
    let _ = exec.task_delete(id);
    r
}
