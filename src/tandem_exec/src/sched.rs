//! The scheduler core.
//!
//! # Locking
//!
//! One global scheduler lock (a spin mutex around [`SchedState`])
//! serializes every mutation of the ready list, the timed list, the
//! blocker queues, and the per-CPU records, mirroring the global lock of
//! the SMP source. Decisions are computed under the lock into a [`Plan`];
//! context-switch side effects (resuming, parking, remote-parking,
//! re-arming the timer) execute after the lock is dropped, so no thread
//! ever sleeps holding it.
//!
//! # The hot path
//!
//! [`Executive::schedule_locked`] is the one place a scheduling decision
//! is made. It runs on behalf of exactly one CPU:
//!
//! 1. note that scheduling was requested (consumed by `sched_unlock`);
//! 2. in one-shot mode, *anticipate*: re-read the clock and wake timed
//!    tasks whose deadline already passed, collapsing near-coincident
//!    wake-ups into one context switch;
//! 3. charge the round-robin quantum of the current task and rotate it
//!    behind its priority peers if the quantum expired;
//! 4. walk the ready list for the first task admitted by CPU affinity;
//! 5. in one-shot mode, derive the next timer deadline from the next GPOS
//!    tick, the earliest timed task at or above the chosen priority, and
//!    the round-robin yield deadline, and re-arm the shot if it moved;
//! 6. commit the switch: pipeline stage transitions around the GPOS
//!    placeholder, lazy FPU hand-off, execution-time accounting.
//!
//! # State bits
//!
//! The `READY` bit stays set for the whole life of a task; blocking adds
//! bits on top of it and waking removes them, so "runnable" is the test
//! `state == READY` with no other bit set. A running task stays on the
//! ready list; `sched_lock` relies on this (see the priority-ladder
//! comments below).
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arrayvec::ArrayVec;
use slab::Slab;

use crate::{
    error::{InitError, SleepError, TaskError},
    exec::Executive,
    pipeline::{CtxId, Pipeline, Stage, TaskEntry},
    sem::{CondCb, SemCb, SemKind},
    task::{
        self, hardness, ready_enq, ready_rem, timed_enq, timed_rem, wait_enq, wait_pop_front,
        wait_rem, Blocker, CtxKind, ListHead, Priority, QueueOrder, TaskCb, TaskId, TaskOptions,
        TaskState, WaitRes, DELETION_PENDING, GPOS_PRIORITY, HIGHEST_PRIORITY, RPC_UNIT,
    },
    time::{Count, TimeBase, TimerMode, TunedConstants},
    utils::scale64,
};

/// Capacity of the gatekeeper promotion rings.
const RING: usize = 64;

/// Per-CPU absolute time bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RtTimes {
    /// Time of the most recent tick, internal counts.
    pub tick_time: Count,
    /// When the GPOS expects its next tick.
    pub linux_time: Count,
    /// When the next RT timer interrupt is programmed for.
    pub intr_time: Count,
    /// The GPOS tick period.
    pub linux_tick: Count,
    /// The RT periodic tick period (periodic mode only).
    pub periodic_tick: Count,
}

/// Per-CPU scheduler record.
#[derive(Debug)]
pub(crate) struct CpuSched {
    /// Index of the task this CPU is running (the GPOS placeholder when
    /// nothing real-time is ready).
    pub current: u32,
    /// Index of this CPU's GPOS placeholder TCB.
    pub gpos: u32,
    /// Index of the task owning the FPU on this CPU.
    pub fpu_owner: u32,
    /// Set by the scheduler, cleared by `sched_lock`; `sched_unlock`
    /// reschedules at the outermost release if it is set again.
    pub sched_rqsted: bool,
    /// A reschedule was requested inside an interrupt handler; honored
    /// at outermost dispatch exit.
    pub deferred_resched: bool,
    /// Interrupt-dispatch nesting depth.
    pub isr_nesting: u32,
    /// A one-shot deadline is armed.
    pub shot_fired: bool,
    pub rt_times: RtTimes,
    /// Clock value when the current task was switched in.
    pub switch_ts: Count,
    /// GPOS FPU-disable bit snapshot taken when leaving the placeholder.
    pub gpos_fpu_disable: bool,
}

/// Everything the global scheduler lock protects.
pub(crate) struct SchedState {
    pub tasks: Slab<TaskCb>,
    pub sems: Slab<SemCb>,
    pub conds: Slab<CondCb>,
    pub ready: ListHead,
    pub timed: ListHead,
    pub cpus: Vec<CpuSched>,
    /// Pipeline context -> task index.
    pub ctx_map: HashMap<usize, u32>,
    /// Contexts that are adopted GPOS threads (twins).
    pub adopted_ctxs: HashSet<usize>,
    pub base: TimeBase,
    pub tuned: TunedConstants,
    pub timer_mode: TimerMode,
    pub timer_running: bool,
    /// Current time plus the half-tick tolerance; timed tasks at or
    /// below this are due.
    pub rt_time_h: Count,
    pub watchdog: Option<u32>,
    pub next_tid: i32,
    pub next_tag: u32,
    pub msg_order: QueueOrder,
    /// In one-shot mode, arm the timer even when the GPOS placeholder is
    /// about to run.
    pub preempt_always: bool,
    /// Per-CPU promotion requests awaiting the gatekeeper.
    pub gk_rings: Vec<ArrayVec<u32, RING>>,
    /// Per-CPU gatekeeper contexts.
    pub gk_ctx: Vec<Option<CtxId>>,
    /// Twins queued for soft-mode wake-up by the service request.
    pub wake_ring: Vec<CtxId>,
}

impl SchedState {
    pub fn new(
        ncpus: usize,
        base: TimeBase,
        tuned: TunedConstants,
        timer_mode: TimerMode,
        msg_order: QueueOrder,
    ) -> Self {
        let mut tasks = Slab::new();
        let mut cpus = Vec::with_capacity(ncpus);
        for cpu in 0..ncpus {
            let mut gpos = TaskCb::new(1, -(cpu as i32) - 1, GPOS_PRIORITY, CtxKind::Gpos);
            gpos.state = TaskState::READY;
            gpos.suspdepth = 0;
            gpos.is_hard.store(hardness::SOFT, Ordering::Relaxed);
            let idx = tasks.insert(gpos) as u32;
            cpus.push(CpuSched {
                current: idx,
                gpos: idx,
                fpu_owner: idx,
                sched_rqsted: false,
                deferred_resched: false,
                isr_nesting: 0,
                shot_fired: false,
                rt_times: RtTimes::default(),
                switch_ts: 0,
                gpos_fpu_disable: false,
            });
        }
        Self {
            tasks,
            sems: Slab::new(),
            conds: Slab::new(),
            ready: ListHead::default(),
            timed: ListHead::default(),
            cpus,
            ctx_map: HashMap::new(),
            adopted_ctxs: HashSet::new(),
            base,
            tuned,
            timer_mode,
            timer_running: false,
            rt_time_h: 0,
            watchdog: None,
            next_tid: 1,
            next_tag: 2,
            msg_order,
            preempt_always: false,
            gk_rings: (0..ncpus).map(|_| ArrayVec::new()).collect(),
            gk_ctx: vec![None; ncpus],
            wake_ring: Vec::new(),
        }
    }

    /// Resolve a handle, checking the generation tag.
    pub fn resolve(&self, id: TaskId) -> Option<u32> {
        let t = self.tasks.get(id.idx as usize)?;
        (t.tag == id.tag && !t.zombie).then_some(id.idx)
    }

    pub fn tcb(&self, id: TaskId) -> Option<&TaskCb> {
        self.resolve(id).map(|i| &self.tasks[i as usize])
    }

    /// Whether the task is scheduled by the executive (as opposed to
    /// running under the GPOS as a soft task).
    pub fn hard_scheduled(&self, idx: u32) -> bool {
        let t = &self.tasks[idx as usize];
        match t.ctx_kind {
            CtxKind::Pooled => true,
            CtxKind::Gpos => false,
            CtxKind::Adopted => t.is_hard.load(Ordering::Acquire) != hardness::SOFT,
        }
    }

    /// The one-shot timer is driving the scheduler.
    pub fn oneshot_running(&self) -> bool {
        self.timer_running && self.timer_mode == TimerMode::Oneshot
    }

    /// Remove from the ready list if the task is linked on it.
    pub fn unready(&mut self, idx: u32) {
        if self.ready.first == Some(idx)
            || self.tasks[idx as usize].rlink.prev.is_some()
            || self.tasks[idx as usize].rlink.next.is_some()
        {
            ready_rem(&mut self.tasks, &mut self.ready, idx);
        }
    }
}

/// A context-switch decision: deschedule `out_ctx`, run `in_ctx` (or the
/// GPOS stage when `None`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct SwitchStep {
    pub cpu: usize,
    pub out_ctx: Option<CtxId>,
    pub in_ctx: Option<CtxId>,
}

/// Side effects computed under the scheduler lock, executed after it is
/// dropped.
pub(crate) struct Plan {
    pub switch: Option<SwitchStep>,
    /// Contexts to hand a run token (soft wake-ups, gatekeepers,
    /// deletion notices).
    pub resumes: ArrayVec<CtxId, 8>,
    /// CPUs to send a reschedule request.
    pub kicks: u64,
    /// One-shot delay to program, timer units.
    pub program: Option<Count>,
    /// Pend the service-request vector to the GPOS stage.
    pub pend_srq: bool,
    /// Synchronize this CPU's GPOS stage even without a switch.
    pub sync_gpos: Option<usize>,
    /// The calling task finished its own (possibly deferred) deletion:
    /// instead of parking, the context terminates (`Some(true)` for a
    /// pooled context) or falls back to plain GPOS execution
    /// (`Some(false)` for an adopted thread).
    pub exit_self: Option<bool>,
}

impl Plan {
    pub fn new() -> Self {
        Self {
            switch: None,
            resumes: ArrayVec::new(),
            kicks: 0,
            program: None,
            pend_srq: false,
            sync_gpos: None,
            exit_self: None,
        }
    }

    pub fn resume(&mut self, ctx: CtxId) {
        if !self.resumes.contains(&ctx) && !self.resumes.is_full() {
            self.resumes.push(ctx);
        }
    }
}

impl<P: Pipeline> Executive<P> {
    // -----------------------------------------------------------------
    // Scheduling engine

    /// The task index the calling thread is registered as.
    pub(crate) fn current_task_idx(&self, g: &SchedState) -> Option<u32> {
        let ctx = self.pipeline.current()?;
        g.ctx_map.get(&ctx.0).copied()
    }

    /// The scheduling decision. See the module docs for the walk-through.
    pub(crate) fn schedule_locked(&self, g: &mut SchedState, cpu: usize, plan: &mut Plan) {
        g.cpus[cpu].sched_rqsted = true;
        if g.cpus[cpu].isr_nesting > 0 {
            // Wake-ups from interrupt handlers coalesce into one switch
            // at outermost dispatch exit.
            g.cpus[cpu].deferred_resched = true;
            return;
        }
        let cur = g.cpus[cpu].current;
        self.rr_yield(g, cpu, cur);

        if g.oneshot_running() {
            // Anticipation: wake what is already due before choosing.
            g.rt_time_h = self.pipeline.read_cpu_counts() + g.tuned.half_tick;
            self.wake_up_timed_tasks(g, plan);
        }

        let next = self.pick(g, cpu);
        let prio = g.tasks[next as usize].priority;
        if g.tasks[next as usize].policy > 0 {
            let rr = g.tasks[next as usize].rr_remaining;
            g.tasks[next as usize].yield_time = g.rt_time_h + rr;
        }

        if g.oneshot_running() {
            let times = g.cpus[cpu].rt_times;
            let mut intr_time = if g.cpus[cpu].shot_fired {
                times.intr_time
            } else {
                times.intr_time + times.linux_tick
            };
            let mut preempt = false;
            if g.tasks[next as usize].policy > 0 {
                preempt = true;
                if g.tasks[next as usize].yield_time < intr_time {
                    intr_time = g.tasks[next as usize].yield_time;
                }
            }
            let mut at = g.timed.first;
            while let Some(i) = at {
                let t = &g.tasks[i as usize];
                if t.priority <= prio && t.resume_time < intr_time {
                    intr_time = t.resume_time;
                    preempt = true;
                    break;
                }
                at = t.tlink.next;
            }
            if preempt || (!g.cpus[cpu].shot_fired && prio == GPOS_PRIORITY) {
                g.cpus[cpu].shot_fired = true;
                if preempt {
                    g.cpus[cpu].rt_times.intr_time = intr_time;
                }
                self.arm_shot(g, cpu, plan);
            }
        }

        if next != cur {
            self.commit_switch(g, cpu, cur, next, plan);
        }
    }

    /// Program the one-shot timer for `rt_times.intr_time`, compensating
    /// for dispatch latency and pushing the deadline out if the chip
    /// cannot be re-armed in time.
    pub(crate) fn arm_shot(&self, g: &mut SchedState, cpu: usize, plan: &mut Plan) {
        let now = self.pipeline.read_cpu_counts();
        let delay = g.cpus[cpu].rt_times.intr_time - now - g.tuned.latency_cpu_units;
        if delay >= g.tuned.setup_cpu_units {
            plan.program = Some(scale64(
                delay,
                g.base.timer_freq as i64,
                g.base.cpu_freq as i64,
            ));
        } else {
            plan.program = Some(g.tuned.setup_timer_units);
            g.cpus[cpu].rt_times.intr_time = now + g.tuned.setup_cpu_units;
        }
    }

    /// First ready task this CPU may run; the GPOS placeholder otherwise.
    pub(crate) fn pick(&self, g: &SchedState, cpu: usize) -> u32 {
        let mut at = g.ready.first;
        while let Some(i) = at {
            let t = &g.tasks[i as usize];
            if t.affinity & (1 << cpu) != 0 && t.running_on.map_or(true, |c| c == cpu) {
                return i;
            }
            at = t.rlink.next;
        }
        g.cpus[cpu].gpos
    }

    /// Charge the running task's round-robin quantum; rotate it behind
    /// its last priority peer once the quantum is spent.
    fn rr_yield(&self, g: &mut SchedState, cpu: usize, cur: u32) {
        if cur == g.cpus[cpu].gpos || g.tasks[cur as usize].policy <= 0 {
            return;
        }
        let tick_time = g.cpus[cpu].rt_times.tick_time;
        let t = &mut g.tasks[cur as usize];
        t.rr_remaining = t.yield_time - tick_time;
        if t.rr_remaining <= 0 {
            t.rr_remaining = t.rr_quantum;
            if t.state == TaskState::READY {
                ready_rem(&mut g.tasks, &mut g.ready, cur);
                ready_enq(&mut g.tasks, &mut g.ready, cur);
            }
        }
    }

    /// Commit `cur` -> `next` on `cpu`: stage transitions, FPU hand-off,
    /// execution-time accounting, and the switch step for the plan.
    fn commit_switch(&self, g: &mut SchedState, cpu: usize, cur: u32, next: u32, plan: &mut Plan) {
        let gpos = g.cpus[cpu].gpos;
        log::trace!(
            "cpu{cpu}: switch {} -> {}",
            g.tasks[cur as usize].tid,
            g.tasks[next as usize].tid
        );
        if cur == gpos {
            // Leaving the GPOS: the RT stage takes over interrupt
            // delivery and the GPOS FPU trap bit is parked.
            self.pipeline.stall(Stage::Gpos, cpu);
            g.cpus[cpu].gpos_fpu_disable = self.pipeline.fpu_disable_bit(cpu);
            self.pipeline.set_fpu_disable_bit(cpu, false);
        }
        if g.tasks[next as usize].uses_fpu {
            self.pipeline.set_fpu_disable_bit(cpu, false);
            if g.cpus[cpu].fpu_owner != next {
                let owner = g.cpus[cpu].fpu_owner;
                self.pipeline
                    .fpu_save(cpu, &mut g.tasks[owner as usize].fpu_area);
                g.cpus[cpu].fpu_owner = next;
                self.pipeline
                    .fpu_restore(cpu, &g.tasks[next as usize].fpu_area);
            }
        }

        let now = self.pipeline.read_cpu_counts();
        if cur != gpos {
            let delta = (now - g.cpus[cpu].switch_ts).max(0) as u64;
            g.tasks[cur as usize]
                .exectime
                .fetch_add(delta, Ordering::Relaxed);
        }
        g.cpus[cpu].switch_ts = now;

        if next == gpos {
            // Back to the GPOS: restore its FPU trap bit and re-enable
            // its stage. The stage is synchronized only after the actual
            // switch (see `run_plan`), never on a real-time stack.
            self.pipeline
                .set_fpu_disable_bit(cpu, g.cpus[cpu].gpos_fpu_disable);
            self.pipeline.unstall(Stage::Gpos, cpu);
        }

        if cur != gpos {
            g.tasks[cur as usize].running_on = None;
        }
        if next != gpos {
            g.tasks[next as usize].running_on = Some(cpu);
        }
        g.cpus[cpu].current = next;

        plan.switch = Some(SwitchStep {
            cpu,
            out_ctx: if cur == gpos {
                None
            } else {
                g.tasks[cur as usize].ctx
            },
            in_ctx: if next == gpos {
                None
            } else {
                g.tasks[next as usize].ctx
            },
        });

        // A deleted task vacates its slot once it is switched away from.
        if cur != gpos && g.tasks[cur as usize].zombie {
            self.reap(g, cur);
        }
    }

    /// Wake every timed task due at `rt_time_h`. Tasks that were blocked
    /// with a deadline time out: they are detached from their blocker,
    /// the blocker's count is restored, and the wait result says so.
    pub(crate) fn wake_up_timed_tasks(&self, g: &mut SchedState, plan: &mut Plan) {
        while let Some(i) = g.timed.first {
            if g.tasks[i as usize].resume_time > g.rt_time_h {
                break;
            }
            timed_rem(&mut g.tasks, &mut g.timed, i);
            let blocked = g.tasks[i as usize].state.intersects(TaskState::BLOCKED);
            g.tasks[i as usize].state.remove(TaskState::DELAYED);
            if blocked {
                self.cancel_block(g, i, WaitRes::Timeout, plan);
            }
            self.make_ready(g, i, plan);
        }
    }

    /// Detach a blocked task from whatever it waits on, restoring the
    /// blocker's state, and record `res` as the wait outcome (unless one
    /// was already recorded).
    pub(crate) fn cancel_block(&self, g: &mut SchedState, idx: u32, res: WaitRes, plan: &mut Plan) {
        match g.tasks[idx as usize].blocked_on {
            Some(Blocker::Sem(s)) => {
                let owner = {
                    let SchedState { tasks, sems, .. } = g;
                    let sem = &mut sems[s as usize];
                    wait_rem(tasks, &mut sem.queue, idx);
                    if sem.kind == SemKind::Counting {
                        sem.count += 1;
                    }
                    (sem.kind == SemKind::Resource).then_some(sem.owner).flatten()
                };
                if let Some(owner) = owner {
                    self.restore_inherited(g, owner);
                }
            }
            Some(Blocker::Cond(c)) => {
                let SchedState { tasks, conds, .. } = g;
                wait_rem(tasks, &mut conds[c as usize].queue, idx);
            }
            Some(Blocker::MsgQueue(d)) => {
                let mut head = std::mem::take(&mut g.tasks[d as usize].msgq);
                wait_rem(&mut g.tasks, &mut head, idx);
                g.tasks[d as usize].msgq = head;
                if g.tasks[idx as usize].state.contains(TaskState::RPC) {
                    self.restore_inherited(g, d);
                }
            }
            Some(Blocker::RetQueue(d)) => {
                let mut head = std::mem::take(&mut g.tasks[d as usize].retq);
                wait_rem(&mut g.tasks, &mut head, idx);
                g.tasks[d as usize].retq = head;
                g.tasks[d as usize].owndres -= RPC_UNIT;
                self.restore_inherited(g, d);
                self.check_deferred_delete(g, d, plan);
            }
            Some(Blocker::Receive(_)) | None => {}
        }
        let t = &mut g.tasks[idx as usize];
        t.blocked_on = None;
        t.state.remove(TaskState::BLOCKED);
        if t.wait_res == WaitRes::Pending {
            t.wait_res = res;
        }
    }

    /// Make a runnable task schedulable: hard tasks join the ready list,
    /// soft tasks are handed back to the GPOS scheduler. Remote CPUs
    /// that should preempt get a reschedule kick.
    pub(crate) fn make_ready(&self, g: &mut SchedState, idx: u32, plan: &mut Plan) {
        if g.tasks[idx as usize].state != TaskState::READY {
            return;
        }
        if g.hard_scheduled(idx) {
            ready_enq(&mut g.tasks, &mut g.ready, idx);
            let this_cpu = self.pipeline.current_cpu();
            let t = &g.tasks[idx as usize];
            for (cpu, cs) in g.cpus.iter().enumerate() {
                if cpu == this_cpu || t.affinity & (1 << cpu) == 0 {
                    continue;
                }
                if g.tasks[cs.current as usize].priority > t.priority {
                    plan.kicks |= 1 << cpu;
                    break;
                }
            }
        } else if let Some(ctx) = g.tasks[idx as usize].ctx {
            plan.resume(ctx);
        }
    }

    /// Block the calling task. The caller has already set the blocking
    /// state bits, `blocked_on`, queue membership, and `wait_res =
    /// Pending`; this removes it from the ready list, optionally starts
    /// the timeout clock, schedules away, and parks until woken.
    /// Returns the wait outcome recorded by the waker.
    pub(crate) fn block_current(
        &self,
        g: spin::MutexGuard<'_, SchedState>,
        me: u32,
        until: Option<Count>,
    ) -> WaitRes {
        self.block_current_with(g, me, until, Plan::new())
    }

    /// [`block_current`], carrying side effects the caller accumulated
    /// under the same lock hold (wake-ups that must not race the park).
    pub(crate) fn block_current_with(
        &self,
        mut g: spin::MutexGuard<'_, SchedState>,
        me: u32,
        until: Option<Count>,
        mut plan: Plan,
    ) -> WaitRes {
        let cpu = self.pipeline.current_cpu();
        if let Some(t) = until {
            g.tasks[me as usize].resume_time = t;
            g.tasks[me as usize].state.insert(TaskState::DELAYED);
            let state = &mut *g;
            timed_enq(&mut state.tasks, &mut state.timed, me);
        }
        g.unready(me);
        let hard = g.hard_scheduled(me);
        if hard {
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        drop(g);
        let parked = self.run_plan(plan);
        if !parked {
            self.pipeline.park_current();
        }
        if !self.switched_in() {
            // Deleted while parked, and this is an adopted GPOS thread.
            return WaitRes::Unblocked;
        }
        let mut g = self.lock();
        let t = &mut g.tasks[me as usize];
        t.blocked_on = None;
        std::mem::replace(&mut t.wait_res, WaitRes::Pending)
    }

    // -----------------------------------------------------------------
    // Priority inheritance

    /// Pass `from`'s priority up the ownership chain starting at `to`.
    /// Applied synchronously at the moment ownership blocks, before the
    /// requester is parked.
    pub(crate) fn pass_prio(&self, g: &mut SchedState, to: u32, from: u32) {
        g.tasks[from as usize].prio_passed_to = Some(to);
        let pr = g.tasks[from as usize].priority;
        let mut node = Some(to);
        while let Some(i) = node {
            if g.tasks[i as usize].priority <= pr {
                break;
            }
            self.set_effective_priority(g, i, pr);
            node = g.tasks[i as usize].prio_passed_to;
        }
    }

    /// Recompute a task's effective priority after it released
    /// something: the best of its base priority, the top waiter of every
    /// resource it still owns, and the heads of its RPC queues while
    /// replies are owed.
    pub(crate) fn restore_inherited(&self, g: &mut SchedState, idx: u32) {
        let mut pr = g.tasks[idx as usize].base_priority;
        let owned = g.tasks[idx as usize].owned_sems.clone();
        for s in owned {
            if let Some(w) = g.sems[s as usize].queue.first {
                pr = pr.min(g.tasks[w as usize].priority);
            }
        }
        if g.tasks[idx as usize].pending_rpcs() > 0 {
            if let Some(w) = g.tasks[idx as usize].retq.first {
                pr = pr.min(g.tasks[w as usize].priority);
            }
            if let Some(w) = g.tasks[idx as usize].msgq.first {
                pr = pr.min(g.tasks[w as usize].priority);
            }
        }
        if pr != g.tasks[idx as usize].priority {
            self.set_effective_priority(g, idx, pr);
        }
    }

    /// Change the effective priority and reposition the task wherever it
    /// is queued by priority.
    pub(crate) fn set_effective_priority(&self, g: &mut SchedState, idx: u32, pr: Priority) {
        g.tasks[idx as usize].priority = pr;
        if g.tasks[idx as usize].state == TaskState::READY && g.hard_scheduled(idx) {
            g.unready(idx);
            ready_enq(&mut g.tasks, &mut g.ready, idx);
            return;
        }
        match g.tasks[idx as usize].blocked_on {
            Some(Blocker::Sem(s)) if g.sems[s as usize].order == QueueOrder::Priority => {
                let SchedState { tasks, sems, .. } = g;
                let q = &mut sems[s as usize].queue;
                wait_rem(tasks, q, idx);
                wait_enq(tasks, q, idx, QueueOrder::Priority);
            }
            Some(Blocker::MsgQueue(d)) if g.msg_order == QueueOrder::Priority => {
                let mut head = std::mem::take(&mut g.tasks[d as usize].msgq);
                wait_rem(&mut g.tasks, &mut head, idx);
                wait_enq(&mut g.tasks, &mut head, idx, QueueOrder::Priority);
                g.tasks[d as usize].msgq = head;
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------
    // Task lifecycle

    /// Create a real-time task. It starts suspended; release it with
    /// [`task_resume`](Self::task_resume) or
    /// [`task_make_periodic`](Self::task_make_periodic).
    ///
    /// The body runs on a context drawn from the reservoir; when it
    /// returns, the task deletes itself.
    pub fn task_init<F>(
        self: &Arc<Self>,
        priority: Priority,
        opts: TaskOptions,
        body: F,
    ) -> Result<TaskId, InitError>
    where
        F: FnOnce(Arc<Self>, TaskId) + Send + 'static,
    {
        self.task_init_inner(priority, opts, None, body)
    }

    /// [`task_init`](Self::task_init), pinned to one CPU.
    pub fn task_init_cpuid<F>(
        self: &Arc<Self>,
        priority: Priority,
        opts: TaskOptions,
        cpu: usize,
        body: F,
    ) -> Result<TaskId, InitError>
    where
        F: FnOnce(Arc<Self>, TaskId) + Send + 'static,
    {
        self.task_init_inner(priority, opts, Some(cpu), body)
    }

    fn task_init_inner<F>(
        self: &Arc<Self>,
        priority: Priority,
        mut opts: TaskOptions,
        cpu: Option<usize>,
        body: F,
    ) -> Result<TaskId, InitError>
    where
        F: FnOnce(Arc<Self>, TaskId) + Send + 'static,
    {
        if priority < HIGHEST_PRIORITY {
            return Err(InitError::BadParam);
        }
        let pinned = cpu.or(opts.cpu);
        let cpu = pinned.unwrap_or(0);
        if cpu >= self.pipeline.num_cpus() {
            return Err(InitError::BadParam);
        }

        let mut g = self.lock();
        if priority == HIGHEST_PRIORITY {
            if let Some(wd) = g.watchdog {
                if g.tasks.contains(wd as usize) {
                    log::warn!("highest priority reserved for the watchdog");
                    return Err(InitError::Busy);
                }
            }
        }
        if let Some(name) = &opts.name {
            if g.tasks.iter().any(|(_, t)| t.name.as_ref() == Some(name)) {
                return Err(InitError::Busy);
            }
        }

        let idx = g.tasks.vacant_entry().key() as u32;
        let tag = g.next_tag;
        let id = TaskId { idx, tag };
        let entry: TaskEntry = Box::new({
            let w = Arc::downgrade(self);
            move || {
                let Some(exec) = w.upgrade() else { return };
                // Deleted before it ever ran: hand the context straight
                // back.
                if exec.lock().resolve(id).is_none() {
                    return;
                }
                body(Arc::clone(&exec), id);
                let _ = exec.task_delete(id);
            }
        });
        let ctx = self
            .pipeline
            .reserve_context(cpu, opts.stack_size, entry)
            .map_err(|_| InitError::Exhausted)?;

        g.next_tag = g.next_tag.wrapping_add(1).max(2);
        let tid = g.next_tid;
        g.next_tid += 1;
        let mut tcb = TaskCb::new(tag, tid, priority, CtxKind::Pooled);
        tcb.name = opts.name.take();
        tcb.uses_fpu = opts.uses_fpu;
        tcb.policy = opts.policy;
        tcb.rr_quantum = g.base.nano2count(g.timer_mode, opts.rr_quantum_ns).max(1);
        tcb.rr_remaining = tcb.rr_quantum;
        tcb.affinity = if pinned.is_some() || opts.affinity == 0 {
            1 << cpu
        } else {
            opts.affinity
        };
        tcb.stack_size = opts.stack_size;
        tcb.signal_fn = opts.signal.take();
        tcb.ctx = Some(ctx);
        let inserted = g.tasks.insert(tcb) as u32;
        debug_assert_eq!(inserted, idx);
        g.ctx_map.insert(ctx.0, idx);
        log::debug!("task {tid} created at priority {priority} on cpu {cpu}");
        Ok(id)
    }

    /// Delete a task. A task owning resource mutexes is only marked:
    /// deletion completes when the last one is released. Everything
    /// blocked on the victim's message queues wakes with an `Unblocked`
    /// result.
    pub fn task_delete(&self, id: TaskId) -> Result<(), TaskError> {
        let mut plan = Plan::new();
        let deleted_self;
        {
            let mut g = self.lock();
            let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
            if g.tasks[idx as usize].ctx_kind == CtxKind::Gpos {
                return Err(TaskError::NotPermitted);
            }
            let me = self.current_task_idx(&g);
            if g.tasks[idx as usize].owned_mutexes() > 0 && me != Some(idx) {
                // Deferred: the owner keeps running until it lets go.
                g.tasks[idx as usize].suspdepth = DELETION_PENDING;
                log::debug!(
                    "task {} marked for deferred deletion",
                    g.tasks[idx as usize].tid
                );
                return Ok(());
            }
            deleted_self = me == Some(idx);
            self.finalize_delete(&mut g, idx, &mut plan);
            let this_cpu = self.pipeline.current_cpu();
            for (cpu, cs) in g.cpus.iter().enumerate() {
                if cs.current == idx && cpu != this_cpu {
                    plan.kicks |= 1 << cpu;
                }
            }
            if deleted_self || g.cpus[this_cpu].current == idx {
                self.schedule_locked(&mut g, this_cpu, &mut plan);
            }
        }
        if deleted_self {
            // Run the plan's wake-ups, then vanish: this context never
            // returns to the body.
            if let Some(step) = plan.switch.as_mut() {
                if step.out_ctx == self.pipeline.current() {
                    step.out_ctx = None;
                }
            }
            self.run_plan(plan);
            self.pipeline.exit_current()
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Run once the last owned resource goes away on a task marked for
    /// deferred deletion. When the releasing task is the victim itself,
    /// the release call never returns to it: its context terminates
    /// right after the hand-over, like a self-delete.
    pub(crate) fn check_deferred_delete(&self, g: &mut SchedState, idx: u32, plan: &mut Plan) {
        if g.tasks[idx as usize].suspdepth == DELETION_PENDING && g.tasks[idx as usize].owndres == 0
        {
            let is_self = self.current_task_idx(g) == Some(idx);
            let pooled = g.tasks[idx as usize].ctx_kind == CtxKind::Pooled;
            self.finalize_delete(g, idx, plan);
            if is_self {
                // The releasing call never returns to the victim; the
                // caller's trailing scheduler pass switches away and
                // `run_plan` ends the context.
                plan.exit_self = Some(pooled);
            }
        }
    }

    pub(crate) fn finalize_delete(&self, g: &mut SchedState, idx: u32, plan: &mut Plan) {
        // A context parked at an executive checkpoint (blocked, delayed,
        // or suspended, and not on a CPU) can be woken to unwind itself;
        // one preempted mid-body cannot, and is abandoned to the
        // pipeline's teardown.
        let at_checkpoint = g.tasks[idx as usize].running_on.is_none()
            && g.tasks[idx as usize].state.intersects(
                TaskState::BLOCKED | TaskState::SUSPENDED | TaskState::DELAYED,
            );

        let hooks = std::mem::take(&mut g.tasks[idx as usize].exit_hooks);
        for hook in hooks.into_iter().rev() {
            hook();
        }
        timed_rem(&mut g.tasks, &mut g.timed, idx);
        if g.tasks[idx as usize].state.intersects(TaskState::BLOCKED) {
            self.cancel_block(g, idx, WaitRes::Unblocked, plan);
        }
        // Wake senders and RPC callers parked on the victim.
        loop {
            let mut head = std::mem::take(&mut g.tasks[idx as usize].msgq);
            let w = wait_pop_front(&mut g.tasks, &mut head);
            g.tasks[idx as usize].msgq = head;
            let Some(w) = w else { break };
            self.unblock_msg_waiter(g, w, plan);
        }
        loop {
            let mut head = std::mem::take(&mut g.tasks[idx as usize].retq);
            let w = wait_pop_front(&mut g.tasks, &mut head);
            g.tasks[idx as usize].retq = head;
            let Some(w) = w else { break };
            self.unblock_msg_waiter(g, w, plan);
        }
        if g.tasks[idx as usize].state == TaskState::READY && g.hard_scheduled(idx) {
            g.unready(idx);
        }
        for cs in g.cpus.iter_mut() {
            if cs.fpu_owner == idx {
                cs.fpu_owner = cs.gpos;
            }
        }
        let t = &mut g.tasks[idx as usize];
        t.state = TaskState::empty();
        t.zombie = true;
        log::debug!("task {} deleted", t.tid);
        match (t.ctx, at_checkpoint) {
            (Some(ctx), true) => {
                // Wake it so it can notice and unwind.
                plan.resume(ctx);
            }
            (Some(ctx), false) => {
                g.ctx_map.remove(&ctx.0);
                g.adopted_ctxs.remove(&ctx.0);
                if !g.cpus.iter().any(|c| c.current == idx) {
                    self.reap(g, idx);
                }
                // Otherwise the slot is vacated by `commit_switch` when
                // the CPU running it schedules away.
            }
            (None, _) => self.reap(g, idx),
        }
    }

    /// Drop a zombie TCB and its context registrations.
    pub(crate) fn reap(&self, g: &mut SchedState, idx: u32) {
        if let Some(ctx) = g.tasks[idx as usize].ctx {
            g.ctx_map.remove(&ctx.0);
            g.adopted_ctxs.remove(&ctx.0);
        }
        g.tasks.remove(idx as usize);
    }

    fn unblock_msg_waiter(&self, g: &mut SchedState, w: u32, plan: &mut Plan) {
        timed_rem(&mut g.tasks, &mut g.timed, w);
        let t = &mut g.tasks[w as usize];
        t.state
            .remove(TaskState::SEND | TaskState::RPC | TaskState::RETURN | TaskState::DELAYED);
        t.blocked_on = None;
        t.wait_res = WaitRes::Unblocked;
        self.make_ready(g, w, plan);
    }

    /// Suspend a task; suspensions nest.
    pub fn task_suspend(&self, id: TaskId) -> Result<(), TaskError> {
        let mut plan = Plan::new();
        let mut parked_self = false;
        {
            let mut g = self.lock();
            let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
            if g.tasks[idx as usize].ctx_kind == CtxKind::Gpos {
                return Err(TaskError::NotPermitted);
            }
            if g.tasks[idx as usize].suspdepth == DELETION_PENDING {
                return Ok(());
            }
            g.tasks[idx as usize].suspdepth += 1;
            if g.tasks[idx as usize].suspdepth == 1 {
                let was_ready = g.tasks[idx as usize].state == TaskState::READY;
                g.tasks[idx as usize].state.insert(TaskState::SUSPENDED);
                if was_ready && g.hard_scheduled(idx) {
                    g.unready(idx);
                }
                let me = self.current_task_idx(&g);
                if me == Some(idx) {
                    parked_self = true;
                    if g.hard_scheduled(idx) {
                        let cpu = self.pipeline.current_cpu();
                        self.schedule_locked(&mut g, cpu, &mut plan);
                    }
                } else if let Some(cpu) = g.tasks[idx as usize].running_on {
                    plan.kicks |= 1 << cpu;
                }
            }
        }
        let parked = self.run_plan(plan);
        if parked_self && !parked {
            self.pipeline.park_current();
        }
        if parked_self || parked {
            self.switched_in();
        }
        Ok(())
    }

    /// Undo one suspension; at depth zero the task becomes schedulable
    /// again (or resumes counting its delay).
    pub fn task_resume(&self, id: TaskId) -> Result<(), TaskError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
            if g.tasks[idx as usize].suspdepth <= 0 {
                return Ok(());
            }
            g.tasks[idx as usize].suspdepth -= 1;
            if g.tasks[idx as usize].suspdepth == 0 {
                g.tasks[idx as usize].state.remove(TaskState::SUSPENDED);
                self.make_ready(&mut g, idx, &mut plan);
                let cpu = self.pipeline.current_cpu();
                self.schedule_locked(&mut g, cpu, &mut plan);
            }
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Put a task on a fixed-period schedule, first releasing it at
    /// `start_time` (absolute, internal counts).
    pub fn task_make_periodic(
        &self,
        id: TaskId,
        start_time: Count,
        period: Count,
    ) -> Result<(), TaskError> {
        if period <= 0 {
            return Err(TaskError::NotPermitted);
        }
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
            let was_ready = g.tasks[idx as usize].state == TaskState::READY;
            {
                let t = &mut g.tasks[idx as usize];
                t.period = period;
                t.resume_time = start_time;
                if t.suspdepth > 0 {
                    t.suspdepth = 0;
                    t.state.remove(TaskState::SUSPENDED);
                }
            }
            if !g.tasks[idx as usize].state.contains(TaskState::DELAYED) {
                if was_ready && g.hard_scheduled(idx) {
                    g.unready(idx);
                }
                g.tasks[idx as usize].state.insert(TaskState::DELAYED);
                let state = &mut *g;
                timed_enq(&mut state.tasks, &mut state.timed, idx);
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Wait for the next period of the calling periodic task. An overrun
    /// returns immediately, adopting the missed deadline as the new
    /// reference so the schedule does not drift.
    pub fn task_wait_period(&self) -> Result<(), SleepError> {
        let mut g = self.lock();
        let me = self.current_task_idx(&g).ok_or(SleepError::NotPermitted)?;
        if g.tasks[me as usize].period == 0 {
            return Err(SleepError::BadParam);
        }
        let next = g.tasks[me as usize].resume_time + g.tasks[me as usize].period;
        g.tasks[me as usize].resume_time = next;
        if next > g.rt_time_h {
            g.tasks[me as usize].wait_res = WaitRes::Pending;
            self.block_current(g, me, Some(next));
        }
        Ok(())
    }

    /// Sleep for `delay` internal counts.
    pub fn task_sleep(&self, delay: Count) -> Result<(), SleepError> {
        if delay < 0 {
            return Err(SleepError::BadParam);
        }
        let now = self.get_time();
        self.task_sleep_until(now + delay)
    }

    /// Sleep until the absolute instant `time` (internal counts).
    /// Returns immediately if it already passed.
    pub fn task_sleep_until(&self, time: Count) -> Result<(), SleepError> {
        let mut g = self.lock();
        let me = self.current_task_idx(&g).ok_or(SleepError::NotPermitted)?;
        if time <= g.rt_time_h {
            return Ok(());
        }
        g.tasks[me as usize].wait_res = WaitRes::Pending;
        self.block_current(g, me, Some(time));
        Ok(())
    }

    /// Yield the CPU to the next task of equal priority.
    pub fn task_yield(&self) {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let Some(me) = self.current_task_idx(&g) else {
                return;
            };
            if g.tasks[me as usize].state == TaskState::READY && g.hard_scheduled(me) {
                g.unready(me);
                let state = &mut *g;
                ready_enq(&mut state.tasks, &mut state.ready, me);
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
    }

    /// Change a task's base priority. The effective priority follows
    /// unless inheritance currently holds it higher.
    pub fn change_priority(&self, id: TaskId, priority: Priority) -> Result<(), TaskError> {
        if priority < HIGHEST_PRIORITY {
            return Err(TaskError::NotPermitted);
        }
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
            let old_base = g.tasks[idx as usize].base_priority;
            g.tasks[idx as usize].base_priority = priority;
            if g.tasks[idx as usize].priority == old_base {
                self.set_effective_priority(&mut g, idx, priority);
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Select FIFO (`policy == 0`) or round-robin (`policy > 0`) with
    /// the given quantum.
    pub fn set_sched_policy(
        &self,
        id: TaskId,
        policy: i32,
        rr_quantum_ns: i64,
    ) -> Result<(), TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        let quantum = g.base.nano2count(g.timer_mode, rr_quantum_ns).max(1);
        let t = &mut g.tasks[idx as usize];
        t.policy = policy;
        if policy > 0 {
            t.rr_quantum = quantum;
            t.rr_remaining = quantum;
        }
        Ok(())
    }

    /// Install (or clear) the per-resumption signal function.
    pub fn task_signal_handler(
        &self,
        id: TaskId,
        signal: Option<task::SignalFn>,
    ) -> Result<(), TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        g.tasks[idx as usize].signal_fn = signal;
        Ok(())
    }

    /// Push an exit hook; hooks run LIFO at deletion.
    pub fn task_exit_hook(&self, id: TaskId, hook: task::ExitHook) -> Result<(), TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        g.tasks[idx as usize].exit_hooks.push(hook);
        Ok(())
    }

    /// Restrict the CPUs a task may be picked on. There is no eager
    /// migration: a task already running on an excluded CPU keeps it
    /// until its next scheduling point.
    pub fn set_runnable_on_cpus(&self, id: TaskId, mask: u64) -> Result<(), TaskError> {
        if mask == 0 {
            return Err(TaskError::NotPermitted);
        }
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        g.tasks[idx as usize].affinity = mask;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Scheduler locks

    /// Forbid preemption of the calling task on its CPU. Nests.
    ///
    /// The first lock parks the caller's priority at `-1`, out of band
    /// above every application priority; because the ready list inserts
    /// behind strictly-higher entries, nothing enqueued afterwards can
    /// overtake the caller, so the picker keeps choosing it. Nested
    /// locks walk the priority further down; `sched_unlock` climbs back
    /// and reschedules at the outermost release if anything asked for
    /// one meanwhile.
    pub fn sched_lock(&self) {
        let mut g = self.lock();
        let Some(me) = self.current_task_idx(&g) else {
            return;
        };
        let cpu = self.pipeline.current_cpu();
        let t = &mut g.tasks[me as usize];
        if t.priority >= 0 {
            t.sched_lock_priority = t.priority;
            t.priority = -1;
            g.cpus[cpu].sched_rqsted = false;
        } else {
            t.priority -= 1;
        }
    }

    /// Release one level of [`sched_lock`](Self::sched_lock).
    pub fn sched_unlock(&self) {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let Some(me) = self.current_task_idx(&g) else {
                return;
            };
            let cpu = self.pipeline.current_cpu();
            if g.tasks[me as usize].priority >= 0 {
                return;
            }
            g.tasks[me as usize].priority += 1;
            if g.tasks[me as usize].priority != 0 {
                return;
            }
            g.tasks[me as usize].priority = g.tasks[me as usize].sched_lock_priority;
            if g.tasks[me as usize].state == TaskState::READY && g.hard_scheduled(me) {
                g.unready(me);
                let state = &mut *g;
                ready_enq(&mut state.tasks, &mut state.ready, me);
            }
            if g.cpus[cpu].sched_rqsted {
                self.schedule_locked(&mut g, cpu, &mut plan);
            }
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
    }

    // -----------------------------------------------------------------
    // Watchdog and supervisors

    /// Claim the watchdog slot. From then on the highest priority level
    /// is reserved for `id`.
    pub fn register_watchdog(&self, id: TaskId) -> Result<(), TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        if g.watchdog.is_some() {
            return Err(TaskError::NotPermitted);
        }
        g.watchdog = Some(idx);
        Ok(())
    }

    pub fn deregister_watchdog(&self, id: TaskId) -> Result<(), TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        if g.watchdog != Some(idx) {
            return Err(TaskError::NotPermitted);
        }
        g.watchdog = None;
        Ok(())
    }

    /// Rate-monotonic supervisor: reassign base priorities of periodic
    /// tasks in ascending period order.
    #[cfg(feature = "rms")]
    pub fn spv_rms(&self) {
        let mut g = self.lock();
        let mut order: Vec<(Count, u32)> = g
            .tasks
            .iter()
            .filter(|(_, t)| t.period > 0 && t.ctx_kind != CtxKind::Gpos && t.policy >= 0)
            .map(|(i, t)| (t.period, i as u32))
            .collect();
        order.sort_by_key(|&(p, _)| p);
        for (prio, (_, idx)) in order.into_iter().enumerate() {
            let prio = prio as Priority;
            let inherited =
                g.tasks[idx as usize].priority != g.tasks[idx as usize].base_priority;
            g.tasks[idx as usize].base_priority = prio;
            if !inherited {
                self.set_effective_priority(&mut g, idx, prio);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_exec;
    use crate::task::LOWEST_PRIORITY;

    #[test]
    fn task_starts_ready_suspended_off_the_lists() {
        let exec = mock_exec(1);
        let id = exec
            .task_init(4, TaskOptions::default(), |_, _| {})
            .unwrap();
        let g = exec.lock();
        let t = g.tcb(id).unwrap();
        assert_eq!(t.state, TaskState::READY | TaskState::SUSPENDED);
        assert_eq!(t.suspdepth, 1);
        assert_eq!(g.ready.first, None);
    }

    #[test]
    fn resume_enqueues_suspend_dequeues() {
        let exec = mock_exec(1);
        let a = exec
            .task_init(4, TaskOptions::default(), |_, _| {})
            .unwrap();
        let b = exec
            .task_init(2, TaskOptions::default(), |_, _| {})
            .unwrap();
        exec.task_resume(a).unwrap();
        exec.task_resume(b).unwrap();
        {
            let g = exec.lock();
            // b has the better (smaller) priority and must lead.
            assert_eq!(g.ready.first, Some(b.idx));
        }
        exec.task_suspend(b).unwrap();
        {
            let g = exec.lock();
            assert_eq!(g.ready.first, Some(a.idx));
            assert!(g.tcb(b).unwrap().state.contains(TaskState::SUSPENDED));
        }
        // Nesting: two suspends need two resumes.
        exec.task_suspend(b).unwrap();
        exec.task_resume(b).unwrap();
        {
            let g = exec.lock();
            assert_eq!(g.ready.first, Some(a.idx));
        }
        exec.task_resume(b).unwrap();
        let g = exec.lock();
        assert_eq!(g.ready.first, Some(b.idx));
    }

    #[test]
    fn watchdog_reserves_highest_priority() {
        let exec = mock_exec(1);
        let wd = exec
            .task_init(HIGHEST_PRIORITY, TaskOptions::default(), |_, _| {})
            .unwrap();
        exec.register_watchdog(wd).unwrap();
        let err = exec
            .task_init(HIGHEST_PRIORITY, TaskOptions::default(), |_, _| {})
            .unwrap_err();
        assert_eq!(err, InitError::Busy);
        assert!(exec
            .task_init(LOWEST_PRIORITY, TaskOptions::default(), |_, _| {})
            .is_ok());
    }

    #[test]
    fn pass_prio_follows_the_chain() {
        let exec = mock_exec(1);
        let a = exec
            .task_init(1, TaskOptions::default(), |_, _| {})
            .unwrap();
        let b = exec
            .task_init(5, TaskOptions::default(), |_, _| {})
            .unwrap();
        let c = exec
            .task_init(9, TaskOptions::default(), |_, _| {})
            .unwrap();
        let mut g = exec.lock();
        // c inherited from b earlier; now a passes through b to c.
        g.tasks[b.idx as usize].prio_passed_to = Some(c.idx);
        exec.pass_prio(&mut g, b.idx, a.idx);
        assert_eq!(g.tasks[b.idx as usize].priority, 1);
        assert_eq!(g.tasks[c.idx as usize].priority, 1);
        // Base priorities are untouched.
        assert_eq!(g.tasks[b.idx as usize].base_priority, 5);
        assert_eq!(g.tasks[c.idx as usize].base_priority, 9);
    }

    #[test]
    fn timed_wakeup_requeues_in_deadline_order() {
        let exec = mock_exec(1);
        let a = exec
            .task_init(3, TaskOptions::default(), |_, _| {})
            .unwrap();
        let b = exec
            .task_init(7, TaskOptions::default(), |_, _| {})
            .unwrap();
        let mut g = exec.lock();
        for (id, at) in [(a, 500), (b, 200)] {
            let idx = g.resolve(id).unwrap();
            g.tasks[idx as usize].suspdepth = 0;
            g.tasks[idx as usize].state = TaskState::READY | TaskState::DELAYED;
            g.tasks[idx as usize].resume_time = at;
            let state = &mut *g;
            timed_enq(&mut state.tasks, &mut state.timed, idx);
        }
        assert_eq!(g.timed.first, Some(b.idx));

        let mut plan = Plan::new();
        g.rt_time_h = 250;
        exec.wake_up_timed_tasks(&mut g, &mut plan);
        assert_eq!(g.timed.first, Some(a.idx));
        assert_eq!(g.ready.first, Some(b.idx));
        assert_eq!(g.tcb(a).unwrap().state, TaskState::READY | TaskState::DELAYED);

        g.rt_time_h = 600;
        exec.wake_up_timed_tasks(&mut g, &mut plan);
        assert_eq!(g.timed.first, None);
        // a (priority 3) now leads b (priority 7).
        assert_eq!(g.ready.first, Some(a.idx));
    }
}
