//! Hard/soft migration.
//!
//! A *soft* task is a GPOS thread that registered a TCB
//! ([`Executive::bind_current_thread`]) and calls executive APIs while
//! staying under GPOS scheduling. [`Executive::make_hard`] moves it under
//! the real-time scheduler: the thread posts itself on its CPU's
//! gatekeeper ring and blocks; the gatekeeper — a dedicated GPOS-side
//! helper per CPU — re-parents the TCB into the ready list and lets the
//! scheduler take it from there. [`Executive::make_soft`] is the reverse:
//! the task leaves the ready list and its twin is woken through the
//! service-request vector, so it resumes under GPOS scheduling.
//!
//! Forced demotion: a GPOS signal aimed at the twin, or a trap taken in
//! hard mode, sets `force_soft`; the flag is observed and cleared only by
//! the demoting task itself, at its next pass through the scheduler
//! epilogue.
//!
//! The mode of a task lives in an acquire/release atomic
//! ([`crate::task::hardness`]): 0 soft, 1 hard, 2 in transition.
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::{
    error::{InitError, MigrateError},
    exec::Executive,
    pipeline::{GposEvent, Pipeline},
    sched::Plan,
    task::{hardness, CtxKind, Priority, TaskCb, TaskId, TaskOptions, TaskState},
};

impl<P: Pipeline> Executive<P> {
    /// Register the calling GPOS thread as a soft real-time task. The
    /// thread keeps running under the GPOS until
    /// [`make_hard`](Self::make_hard).
    pub fn bind_current_thread(
        &self,
        priority: Priority,
        mut opts: TaskOptions,
    ) -> Result<TaskId, InitError> {
        if priority < 0 {
            return Err(InitError::BadParam);
        }
        if self.pipeline.current().is_some() && self.whoami().is_some() {
            return Err(InitError::Busy);
        }
        let ctx = self.pipeline.adopt_current();
        let mut g = self.lock();
        let tag = g.next_tag;
        g.next_tag = g.next_tag.wrapping_add(1).max(2);
        let tid = g.next_tid;
        g.next_tid += 1;
        let mut tcb = TaskCb::new(tag, tid, priority, CtxKind::Adopted);
        tcb.state = TaskState::READY;
        tcb.suspdepth = 0;
        tcb.is_hard.store(hardness::SOFT, Ordering::Release);
        tcb.name = opts.name.take();
        tcb.uses_fpu = opts.uses_fpu;
        tcb.affinity = opts.affinity;
        tcb.signal_fn = opts.signal.take();
        tcb.ctx = Some(ctx);
        let idx = g.tasks.insert(tcb) as u32;
        g.ctx_map.insert(ctx.0, idx);
        g.adopted_ctxs.insert(ctx.0);
        log::debug!("thread bound as soft task {tid} at priority {priority}");
        Ok(TaskId { idx, tag })
    }

    /// Drop the calling thread's soft-task registration.
    pub fn unbind_current_thread(&self) -> Result<(), MigrateError> {
        let ctx = self.pipeline.current().ok_or(MigrateError::NotPermitted)?;
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let idx = *g.ctx_map.get(&ctx.0).ok_or(MigrateError::NotPermitted)?;
            if g.tasks[idx as usize].is_hard.load(Ordering::Acquire) != hardness::SOFT {
                return Err(MigrateError::NotPermitted);
            }
            self.finalize_delete(&mut g, idx, &mut plan);
            // We are soft and awake, so nothing can have switched us out.
            debug_assert!(plan.switch.is_none());
        }
        // Anyone parked on our queues still has to wake up.
        self.run_plan(plan);
        self.pipeline.release_adopted(ctx);
        Ok(())
    }

    /// Move the calling soft task under the real-time scheduler. On
    /// return the thread is running as a hard task, dispatched by the
    /// executive.
    pub fn make_hard(&self) -> Result<(), MigrateError> {
        let ctx = self.pipeline.current().ok_or(MigrateError::NotPermitted)?;
        let gk = {
            let mut g = self.lock();
            let idx = *g.ctx_map.get(&ctx.0).ok_or(MigrateError::NotPermitted)?;
            if g.tasks[idx as usize].ctx_kind != CtxKind::Adopted {
                return Err(MigrateError::NotPermitted);
            }
            match g.tasks[idx as usize].is_hard.load(Ordering::Acquire) {
                hardness::HARD => return Ok(()),
                hardness::TRANSITIONING => return Err(MigrateError::Busy),
                _ => {}
            }
            let cpu = (g.tasks[idx as usize].affinity.trailing_zeros() as usize)
                .min(g.cpus.len() - 1);
            let Some(gk) = g.gk_ctx[cpu] else {
                return Err(MigrateError::Busy);
            };
            if g.gk_rings[cpu].is_full() {
                return Err(MigrateError::Busy);
            }
            g.tasks[idx as usize]
                .is_hard
                .store(hardness::TRANSITIONING, Ordering::Release);
            g.gk_rings[cpu].push(idx);
            gk
        };
        // Hand over to the gatekeeper and wait to be scheduled as hard.
        self.pipeline.resume(gk);
        self.pipeline.park_current();
        self.switched_in();
        log::debug!("promotion to hard complete");
        Ok(())
    }

    /// Move the calling hard task back under GPOS scheduling.
    pub fn make_soft(&self) -> Result<(), MigrateError> {
        let ctx = self.pipeline.current().ok_or(MigrateError::NotPermitted)?;
        {
            let g = self.lock();
            let idx = *g.ctx_map.get(&ctx.0).ok_or(MigrateError::NotPermitted)?;
            if g.tasks[idx as usize].ctx_kind != CtxKind::Adopted
                || g.tasks[idx as usize].is_hard.load(Ordering::Acquire) != hardness::HARD
            {
                return Err(MigrateError::NotPermitted);
            }
        }
        self.demote_current();
        Ok(())
    }

    /// The demotion path. Runs on the demoting task's own thread,
    /// either voluntarily (`make_soft`), from the scheduler epilogue
    /// (`force_soft`), or from the trap catcher.
    pub(crate) fn demote_current(&self) {
        let Some(ctx) = self.pipeline.current() else {
            return;
        };
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let Some(&idx) = g.ctx_map.get(&ctx.0) else {
                return;
            };
            if g.tasks[idx as usize].ctx_kind != CtxKind::Adopted {
                // A pooled kernel task has no twin to fall back to; the
                // nearest GPOS-visible fate is suspension.
                log::warn!("demotion of a kernel task downgraded to suspension");
                drop(g);
                if let Some(id) = self.whoami() {
                    let _ = self.task_suspend(id);
                }
                return;
            }
            g.tasks[idx as usize]
                .is_hard
                .store(hardness::TRANSITIONING, Ordering::Release);
            g.unready(idx);
            g.tasks[idx as usize].running_on = None;
            // The twin wakes through the service request on the GPOS
            // stage, like any other deferred GPOS work.
            g.wake_ring.push(ctx);
            plan.pend_srq = true;
            let cpu = self.pipeline.current_cpu();
            if g.cpus[cpu].current == idx {
                self.schedule_locked(&mut g, cpu, &mut plan);
            }
        }
        if !self.run_plan(plan) {
            self.pipeline.park_current();
        }
        // Back under GPOS scheduling.
        let g = self.lock();
        if let Some(&idx) = g.ctx_map.get(&ctx.0) {
            g.tasks[idx as usize]
                .is_hard
                .store(hardness::SOFT, Ordering::Release);
        }
        log::debug!("demotion to soft complete");
    }

    /// GPOS lifecycle events subscribed through the pipeline.
    pub(crate) fn dispatch_gpos_event(&self, ev: GposEvent) {
        match ev {
            GposEvent::Signal { ctx, signo } => {
                let g = self.lock();
                if let Some(&idx) = g.ctx_map.get(&ctx.0) {
                    let t = &g.tasks[idx as usize];
                    if t.ctx_kind == CtxKind::Adopted
                        && t.is_hard.load(Ordering::Acquire) == hardness::HARD
                    {
                        // Only the task itself may complete the
                        // demotion; we just request it.
                        log::debug!(
                            "signal {signo} for hard task {}; forcing soft",
                            t.tid
                        );
                        t.force_soft.store(true, Ordering::Release);
                    }
                }
            }
            GposEvent::ProcessExit { ctx } => {
                let id = {
                    let g = self.lock();
                    g.ctx_map
                        .get(&ctx.0)
                        .map(|&idx| g.tasks[idx as usize].id(idx))
                };
                if let Some(id) = id {
                    log::debug!("twin exited; deleting its task");
                    let _ = self.task_delete(id);
                }
            }
            GposEvent::Renice { ctx, prio } => {
                // The GPOS reniced the twin; mirror it onto the base
                // priority so soft-mode queuing stays coherent.
                let id = {
                    let g = self.lock();
                    g.ctx_map
                        .get(&ctx.0)
                        .map(|&idx| g.tasks[idx as usize].id(idx))
                };
                if let Some(id) = id {
                    let _ = self.change_priority(id, prio.max(0));
                }
            }
        }
    }

    /// Bring up one gatekeeper per CPU.
    pub(crate) fn spawn_gatekeepers(self: &Arc<Self>) {
        for cpu in 0..self.pipeline.num_cpus() {
            let w = Arc::downgrade(self);
            self.pipeline.spawn_gpos_worker(
                &format!("tandem-gk{cpu}"),
                Box::new(move || gatekeeper_main(w, cpu)),
            );
        }
    }

    /// Wake every gatekeeper so its thread notices shutdown and exits.
    pub(crate) fn stop_gatekeepers(&self) {
        let ctxs: Vec<_> = {
            let g = self.lock();
            g.gk_ctx.iter().flatten().copied().collect()
        };
        for ctx in ctxs {
            self.pipeline.resume(ctx);
        }
    }
}

/// The gatekeeper body: park until kicked, then re-parent every queued
/// task into the ready list and let the scheduler run.
fn gatekeeper_main<P: Pipeline>(exec: Weak<Executive<P>>, cpu: usize) {
    let ctx = {
        let Some(exec) = exec.upgrade() else { return };
        let ctx = exec.pipeline.adopt_current();
        exec.lock().gk_ctx[cpu] = Some(ctx);
        ctx
    };
    log::debug!("gatekeeper {cpu} up");
    loop {
        {
            let Some(exec) = exec.upgrade() else { return };
            exec.pipeline.park_current();
            if exec.shutting_down.load(Ordering::Acquire) {
                exec.lock().gk_ctx[cpu] = None;
                exec.pipeline.release_adopted(ctx);
                log::debug!("gatekeeper {cpu} down");
                return;
            }
            let mut plan = Plan::new();
            {
                let mut g = exec.lock();
                while let Some(idx) = g.gk_rings[cpu].pop_at(0) {
                    g.tasks[idx as usize]
                        .is_hard
                        .store(hardness::HARD, Ordering::Release);
                    log::debug!("gatekeeper {cpu}: task {} goes hard", g.tasks[idx as usize].tid);
                    exec.make_ready(&mut g, idx, &mut plan);
                }
                exec.schedule_locked(&mut g, cpu, &mut plan);
            }
            exec.run_plan(plan);
        }
    }
}
