//! The executive context object.
//!
//! All process-wide mutable state of the core — the TCB arena, the per-CPU
//! scheduler records, the blocking-object arenas, the IRQ dispatch table,
//! the feature registry — lives inside [`Executive`], created by
//! [`Executive::start`] and torn down on drop. There are no hidden
//! singletons; skins hold an `Arc<Executive<P>>` and go through it.
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};

use crate::{
    error::TaskError,
    irq::IrqTable,
    pipeline::{CtxId, DomainHooks, DomainId, GposEvent, IrqVec, Pipeline, TrapDisposition},
    registry::FunTable,
    sched::{Plan, SchedState},
    task::{QueueOrder, TaskId},
    time::{TimeBase, TimerMode, TunedConstants},
};

/// The interrupt vector carrying the GPOS tick. The executive overtakes it
/// while the timer service runs and replays it downstream.
pub(crate) const TIMER_VEC: IrqVec = 0;

/// Module-load parameters of the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Calibrated interrupt-to-scheduler latency, nanoseconds.
    pub latency_ns: i64,
    /// Calibrated one-shot re-arm overhead, nanoseconds.
    pub setup_time_timer_ns: i64,
    /// Override the pipeline-reported CPU frequency.
    pub cpu_freq: Option<u64>,
    /// Override the pipeline-reported hardware-timer frequency.
    pub timer_freq: Option<u64>,
    /// Boot in one-shot mode instead of periodic.
    pub oneshot: bool,
    /// In one-shot mode, always arm the timer even when the GPOS
    /// placeholder is about to run.
    pub preempt_always: bool,
    /// Pre-spawned GPOS thread pool size per CPU (advisory; the pipeline
    /// owns the pool).
    pub reservoir: usize,
    /// Discipline of the per-task inbound message queues.
    pub msg_queue_order: QueueOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency_ns: 4_000,
            setup_time_timer_ns: 3_000,
            cpu_freq: None,
            timer_freq: None,
            oneshot: false,
            preempt_always: false,
            reservoir: 4,
            msg_queue_order: QueueOrder::Fifo,
        }
    }
}

/// The real-time executive.
pub struct Executive<P: Pipeline> {
    pub(crate) pipeline: P,
    pub(crate) cfg: Config,
    pub(crate) state: spin::Mutex<SchedState>,
    pub(crate) irqs: IrqTable,
    pub(crate) registry: spin::Mutex<FunTable>,
    pub(crate) srqs: spin::Mutex<crate::irq::SrqTable>,
    pub(crate) domain: spin::Mutex<Option<DomainId>>,
    /// Virtual IRQ used to run the scheduler in the RT domain when the
    /// request originates outside it.
    pub(crate) sched_virq: AtomicUsize,
    /// Virtual IRQ multiplexing service requests onto the GPOS stage.
    pub(crate) srq_virq: AtomicUsize,
    pub(crate) shutting_down: AtomicBool,
}

impl<P: Pipeline> Executive<P> {
    /// Bring up the executive on `pipeline`: build the per-CPU records,
    /// register the RT domain (grabbing every vector), allocate the two
    /// service virtual IRQs, and start the per-CPU gatekeepers.
    pub fn start(pipeline: P, cfg: Config) -> Arc<Self> {
        let ncpus = pipeline.num_cpus();
        let base = TimeBase {
            cpu_freq: cfg.cpu_freq.unwrap_or_else(|| pipeline.cpu_freq()),
            timer_freq: cfg.timer_freq.unwrap_or_else(|| pipeline.timer_freq()),
        };
        let tuned = TunedConstants::derive(&base, cfg.latency_ns, cfg.setup_time_timer_ns);
        let mode = if cfg.oneshot {
            TimerMode::Oneshot
        } else {
            TimerMode::Periodic
        };
        let mut state = SchedState::new(ncpus, base, tuned, mode, cfg.msg_queue_order);
        state.preempt_always = cfg.preempt_always;

        let this = Arc::new(Self {
            pipeline,
            cfg,
            state: spin::Mutex::new(state),
            irqs: IrqTable::new(),
            registry: spin::Mutex::new(FunTable::new()),
            srqs: spin::Mutex::new(crate::irq::SrqTable::new()),
            domain: spin::Mutex::new(None),
            sched_virq: AtomicUsize::new(0),
            srq_virq: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        // Register the RT domain. The hooks hold weak references so the
        // pipeline does not keep the executive alive.
        let w_irq = Arc::downgrade(&this);
        let w_trap = Arc::downgrade(&this);
        let w_event = Arc::downgrade(&this);
        let hooks = DomainHooks {
            name: "tandem",
            irq: Arc::new(move |cpu, vec| {
                if let Some(exec) = Weak::upgrade(&w_irq) {
                    exec.dispatch_irq(cpu, vec);
                }
            }),
            trap: Arc::new(move |cpu, vec| {
                if let Some(exec) = Weak::upgrade(&w_trap) {
                    exec.dispatch_trap(cpu, vec)
                } else {
                    TrapDisposition::Propagate
                }
            }),
            event: Arc::new(move |ev: GposEvent| {
                if let Some(exec) = Weak::upgrade(&w_event) {
                    exec.dispatch_gpos_event(ev);
                }
            }),
        };
        let id = this
            .pipeline
            .register_domain(hooks)
            .expect("RT domain registration");
        *this.domain.lock() = Some(id);

        // The service virtual IRQs.
        let sched_virq = this.pipeline.alloc_virq().expect("sched virq");
        let srq_virq = this.pipeline.alloc_virq().expect("srq virq");
        this.sched_virq.store(sched_virq, Ordering::Release);
        this.srq_virq.store(srq_virq, Ordering::Release);
        this.install_sched_virq(sched_virq);
        this.install_srq_handler(srq_virq);

        this.spawn_gatekeepers();

        log::debug!(
            "executive up: {ncpus} cpu(s), mode {:?}, sched_virq {sched_virq}, srq_virq {srq_virq}",
            mode
        );
        this
    }

    /// Orderly teardown: stop the timer, unhook the domain, release the
    /// virtual IRQs, and wake the gatekeepers so their threads exit.
    ///
    /// Call this explicitly at unload time. The gatekeeper workers hold
    /// handles to the executive while parked, so dropping the last user
    /// handle alone would leave them waiting.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_timer();
        self.stop_gatekeepers();
        let srq_virq = self.srq_virq.load(Ordering::Acquire);
        self.pipeline.unregister_gpos_handler(srq_virq);
        if let Some(id) = self.domain.lock().take() {
            self.pipeline.unregister_domain(id);
        }
        self.pipeline
            .free_virq(self.sched_virq.load(Ordering::Acquire));
        self.pipeline.free_virq(srq_virq);
        log::debug!("executive down");
    }

    /// The module parameters this executive was started with.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The task the calling thread is registered as, if any.
    pub fn whoami(&self) -> Option<TaskId> {
        let ctx = self.pipeline.current()?;
        let g = self.state.lock();
        let idx = *g.ctx_map.get(&ctx.0)?;
        Some(g.tasks[idx as usize].id(idx))
    }

    /// Cumulative execution time of `task` in CPU counts. Torn-read free.
    pub fn exec_time(&self, task: TaskId) -> Result<u64, TaskError> {
        let g = self.state.lock();
        let tcb = g.tcb(task).ok_or(TaskError::BadTask)?;
        Ok(tcb.exectime.load(Ordering::Relaxed))
    }

    /// Effective and base priority of `task`, in that order. The two
    /// diverge while priority inheritance is in effect.
    pub fn task_priority(
        &self,
        task: TaskId,
    ) -> Result<(crate::task::Priority, crate::task::Priority), TaskError> {
        let g = self.state.lock();
        let tcb = g.tcb(task).ok_or(TaskError::BadTask)?;
        Ok((tcb.priority, tcb.base_priority))
    }

    /// The hard/soft mode of `task`: one of [`crate::task::hardness`].
    pub fn task_is_hard(&self, task: TaskId) -> Result<u8, TaskError> {
        let g = self.state.lock();
        let tcb = g.tcb(task).ok_or(TaskError::BadTask)?;
        Ok(tcb.is_hard.load(Ordering::Acquire))
    }

    /// The stack room configured for the calling task. Contexts come
    /// with their stacks pre-sized, so this reports the configured size
    /// rather than a live headroom measurement.
    pub fn check_stack(&self) -> Result<usize, TaskError> {
        let g = self.state.lock();
        let idx = self
            .current_task_idx(&g)
            .ok_or(TaskError::NotPermitted)?;
        Ok(g.tasks[idx as usize].stack_size)
    }

    /// Look a task up by its numeric id.
    pub fn task_by_tid(&self, tid: i32) -> Option<TaskId> {
        let g = self.state.lock();
        g.tasks
            .iter()
            .find(|(_, t)| t.tid == tid)
            .map(|(i, t)| t.id(i as u32))
    }

    /// Look a task up by name.
    pub fn task_by_name(&self, name: &[u8; 6]) -> Option<TaskId> {
        let g = self.state.lock();
        g.tasks
            .iter()
            .find(|(_, t)| t.name.as_ref() == Some(name))
            .map(|(i, t)| t.id(i as u32))
    }

    #[inline]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, SchedState> {
        self.state.lock()
    }

    /// Run the scheduler on the calling CPU, from any context.
    pub fn rt_schedule(&self) {
        let mut plan = Plan::new();
        let cpu = self.pipeline.current_cpu();
        {
            let mut g = self.lock();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        let parked = self.run_plan(plan);
        if parked {
            self.switched_in();
        }
    }

    fn install_sched_virq(self: &Arc<Self>, virq: IrqVec) {
        // Reschedule requests arriving from outside the RT domain are
        // bounced through this vector so the scheduler runs in RT context.
        let w = Arc::downgrade(self);
        self.request_irq(virq, true, move |_vec| {
            if let Some(exec) = Weak::upgrade(&w) {
                exec.rt_schedule();
            }
            true
        })
        .expect("sched virq handler");
    }

    fn install_srq_handler(self: &Arc<Self>, virq: IrqVec) {
        let w = Arc::downgrade(self);
        self.pipeline
            .register_gpos_handler(
                virq,
                Arc::new(move || {
                    if let Some(exec) = Weak::upgrade(&w) {
                        exec.gpos_service_drain();
                    }
                }),
            )
            .expect("srq gpos handler");
    }

    /// The GPOS-stage body of the service-request virtual IRQ: wake twins
    /// queued for soft-mode resumption, then run pended user SRQs.
    fn gpos_service_drain(&self) {
        let wakes: Vec<CtxId> = {
            let mut g = self.lock();
            g.wake_ring.drain(..).collect()
        };
        for ctx in wakes {
            self.pipeline.resume(ctx);
        }
        self.run_pending_srqs();
    }

    /// Execute a plan computed under the scheduler lock. Returns `true`
    /// if the calling thread was parked (and has since been resumed).
    pub(crate) fn run_plan(&self, plan: Plan) -> bool {
        if let Some(delay) = plan.program {
            self.pipeline.program_shot(delay);
        }
        let sched_virq = self.sched_virq.load(Ordering::Acquire);
        let mut kicks = plan.kicks;
        while kicks != 0 {
            let cpu = kicks.trailing_zeros() as usize;
            kicks &= kicks - 1;
            self.pipeline.post_virq(cpu, sched_virq);
        }
        for ctx in &plan.resumes {
            self.pipeline.resume(*ctx);
        }
        if plan.pend_srq {
            self.pipeline
                .pend_to_gpos(self.srq_virq.load(Ordering::Acquire));
        }
        let mut parked = false;
        if let Some(step) = plan.switch {
            let caller = self.pipeline.current();
            let out_is_caller = step.out_ctx.is_some() && step.out_ctx == caller;
            if !out_is_caller {
                if let Some(out) = step.out_ctx {
                    // Holding the scheduler lock here guarantees the
                    // displaced context cannot be parked while it holds
                    // that lock itself.
                    let guard = self.state.lock();
                    self.pipeline.remote_park(out);
                    drop(guard);
                }
            }
            match step.in_ctx {
                Some(ctx) => self.pipeline.resume(ctx),
                // Entering the GPOS placeholder: let the GPOS stage play
                // out what was pended while real-time tasks ran.
                None => self.pipeline.sync_gpos_stage(step.cpu),
            }
            if out_is_caller {
                match plan.exit_self {
                    // The caller just completed its own deletion: a
                    // pooled context ends here; an adopted thread simply
                    // keeps running under the GPOS.
                    Some(true) => self.pipeline.exit_current(),
                    Some(false) => {}
                    None => {
                        self.pipeline.park_current();
                        parked = true;
                    }
                }
            }
        } else if let Some(cpu) = plan.sync_gpos {
            self.pipeline.sync_gpos_stage(cpu);
        }
        parked
    }

    /// Epilogue run by a task's own thread right after it is switched in.
    ///
    /// Invokes the task's signal function (which must not re-enter the
    /// executive: it runs under the scheduler lock, the moral equivalent
    /// of "with interrupts disabled"), then honors a pending demotion
    /// request. Returns `false` if the task was deleted while parked.
    pub(crate) fn switched_in(&self) -> bool {
        let Some(ctx) = self.pipeline.current() else {
            return true;
        };
        let force = {
            let g = self.lock();
            let Some(&idx) = g.ctx_map.get(&ctx.0) else {
                // Deleted while parked.
                drop(g);
                return self.vanish_current(ctx);
            };
            let tcb = &g.tasks[idx as usize];
            if tcb.zombie {
                drop(g);
                return self.vanish_current(ctx);
            }
            if let Some(f) = &tcb.signal_fn {
                f();
            }
            tcb.force_soft.swap(false, Ordering::AcqRel)
        };
        if force {
            self.demote_current();
        }
        true
    }

    /// The current thread's task was deleted while it was parked at a
    /// checkpoint. Pooled contexts terminate here; adopted GPOS threads
    /// get an error return instead.
    fn vanish_current(&self, ctx: CtxId) -> bool {
        let adopted = {
            let mut g = self.lock();
            let adopted = g.adopted_ctxs.contains(&ctx.0);
            if let Some(&idx) = g.ctx_map.get(&ctx.0) {
                // The zombie slot was kept so we could find it; done now.
                self.reap(&mut g, idx);
            } else {
                g.ctx_map.remove(&ctx.0);
                g.adopted_ctxs.remove(&ctx.0);
            }
            adopted
        };
        if adopted {
            false
        } else {
            log::trace!("vanishing deleted context {ctx:?}");
            self.pipeline.exit_current()
        }
    }
}

impl<P: Pipeline> Drop for Executive<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
