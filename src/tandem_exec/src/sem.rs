//! Resource primitives: semaphores, resource mutexes, condition
//! variables.
//!
//! All three share one control block shape and one waiter-queue
//! discipline; blocking and wake-up go exclusively through the
//! scheduler's enqueue/dequeue machinery. Every blocking call resolves
//! to one of `Ok`, `Timeout`, `Unblocked` (a partner task died) or
//! `Closed` (the object itself was deleted).
//!
//! The *resource* flavor is a recursive mutex with ownership tracking
//! and priority inheritance: a blocked requester raises the owner (and
//! its promotion chain) to its own priority before parking, and the
//! release path recomputes the owner's priority from what it still
//! holds.
use crate::{
    error::{CreateError, ObjectError, TryWaitError, WaitError, WaitTimeoutError},
    exec::Executive,
    pipeline::Pipeline,
    sched::{Plan, SchedState},
    task::{
        wait_enq, wait_pop_front, timed_rem, Blocker, ListHead, QueueOrder, TaskState, WaitRes,
        MUTEX_UNIT,
    },
    time::Count,
};

/// Semaphore flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemKind {
    /// Classic counting semaphore; the count may go negative while
    /// tasks wait.
    Counting,
    /// Count clamped to {0, 1}.
    Binary,
    /// Binary with owner tracking, recursion, and priority inheritance.
    Resource,
}

/// Handle to a semaphore (any flavor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemId {
    pub(crate) idx: u32,
    pub(crate) tag: u32,
}

/// Handle to a condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondId {
    pub(crate) idx: u32,
    pub(crate) tag: u32,
}

/// Semaphore control block.
pub(crate) struct SemCb {
    pub tag: u32,
    pub kind: SemKind,
    pub count: i32,
    /// Owner task index (resource flavor only).
    pub owner: Option<u32>,
    /// Recursion depth of the owner.
    pub depth: u32,
    pub order: QueueOrder,
    pub queue: ListHead,
}

/// Condition-variable control block. Always used with a resource mutex;
/// holds nothing but its waiter queue.
pub(crate) struct CondCb {
    pub tag: u32,
    pub order: QueueOrder,
    pub queue: ListHead,
}

impl SchedState {
    pub(crate) fn sem(&self, id: SemId) -> Option<u32> {
        let s = self.sems.get(id.idx as usize)?;
        (s.tag == id.tag).then_some(id.idx)
    }

    pub(crate) fn cond(&self, id: CondId) -> Option<u32> {
        let c = self.conds.get(id.idx as usize)?;
        (c.tag == id.tag).then_some(id.idx)
    }
}

impl<P: Pipeline> Executive<P> {
    // -----------------------------------------------------------------
    // Creation and deletion

    /// Create a semaphore. `initial` is the starting count; a binary
    /// semaphore clamps it to {0, 1} and a resource mutex ignores it
    /// (it starts free).
    pub fn sem_init(
        &self,
        kind: SemKind,
        initial: i32,
        order: QueueOrder,
    ) -> Result<SemId, CreateError> {
        if kind == SemKind::Counting && initial < 0 {
            return Err(CreateError::BadParam);
        }
        let mut g = self.lock();
        let tag = g.next_tag;
        g.next_tag = g.next_tag.wrapping_add(1).max(2);
        let count = match kind {
            SemKind::Counting => initial,
            SemKind::Binary => initial.clamp(0, 1),
            SemKind::Resource => 1,
        };
        let idx = g.sems.insert(SemCb {
            tag,
            kind,
            count,
            owner: None,
            depth: 0,
            order,
            queue: ListHead::default(),
        }) as u32;
        Ok(SemId { idx, tag })
    }

    /// Delete a semaphore; every waiter wakes with `Closed`. A held
    /// resource mutex is forcibly released from its owner.
    pub fn sem_delete(&self, id: SemId) -> Result<(), ObjectError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let s = g.sem(id).ok_or(ObjectError::BadObject)?;
            loop {
                let w = {
                    let SchedState { tasks, sems, .. } = &mut *g;
                    wait_pop_front(tasks, &mut sems[s as usize].queue)
                };
                let Some(w) = w else { break };
                self.wake_waiter(&mut g, w, WaitRes::Closed, &mut plan);
            }
            if let Some(owner) = g.sems[s as usize].owner {
                g.tasks[owner as usize].owndres -= MUTEX_UNIT;
                g.tasks[owner as usize].owned_sems.retain(|&x| x != s);
                self.restore_inherited(&mut g, owner);
                self.check_deferred_delete(&mut g, owner, &mut plan);
            }
            g.sems.remove(s as usize);
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    pub fn cond_init(&self, order: QueueOrder) -> Result<CondId, CreateError> {
        let mut g = self.lock();
        let tag = g.next_tag;
        g.next_tag = g.next_tag.wrapping_add(1).max(2);
        let idx = g.conds.insert(CondCb {
            tag,
            order,
            queue: ListHead::default(),
        }) as u32;
        Ok(CondId { idx, tag })
    }

    /// Delete a condition variable; waiters wake with `Closed` (and then
    /// re-acquire their mutex before returning).
    pub fn cond_delete(&self, id: CondId) -> Result<(), ObjectError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let c = g.cond(id).ok_or(ObjectError::BadObject)?;
            loop {
                let w = {
                    let SchedState { tasks, conds, .. } = &mut *g;
                    wait_pop_front(tasks, &mut conds[c as usize].queue)
                };
                let Some(w) = w else { break };
                self.wake_waiter(&mut g, w, WaitRes::Closed, &mut plan);
            }
            g.conds.remove(c as usize);
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Semaphore operations

    /// Take the semaphore, blocking while unavailable.
    pub fn sem_wait(&self, id: SemId) -> Result<(), WaitError> {
        match self.sem_wait_core(id, None) {
            Ok(()) => Ok(()),
            Err(WaitTimeoutError::Timeout) => unreachable!("untimed wait timed out"),
            Err(e) => Err(match e {
                WaitTimeoutError::BadObject => WaitError::BadObject,
                WaitTimeoutError::Unblocked => WaitError::Unblocked,
                WaitTimeoutError::Closed => WaitError::Closed,
                WaitTimeoutError::NotPermitted => WaitError::NotPermitted,
                WaitTimeoutError::Timeout => unreachable!(),
            }),
        }
    }

    /// Take the semaphore only if that needs no blocking.
    pub fn sem_wait_if(&self, id: SemId) -> Result<(), TryWaitError> {
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(TryWaitError::NotPermitted)?;
        let s = g.sem(id).ok_or(TryWaitError::BadObject)?;
        if self.sem_poll(&mut g, s, me) {
            Ok(())
        } else {
            self.sem_unpoll(&mut g, s);
            Err(TryWaitError::WouldBlock)
        }
    }

    /// Take the semaphore, giving up at the absolute instant `time`.
    pub fn sem_wait_until(&self, id: SemId, time: Count) -> Result<(), WaitTimeoutError> {
        self.sem_wait_core(id, Some(time))
    }

    /// Take the semaphore, giving up after `delay` counts.
    pub fn sem_wait_timed(&self, id: SemId, delay: Count) -> Result<(), WaitTimeoutError> {
        let t = self.get_time() + delay;
        self.sem_wait_core(id, Some(t))
    }

    fn sem_wait_core(&self, id: SemId, until: Option<Count>) -> Result<(), WaitTimeoutError> {
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(WaitTimeoutError::NotPermitted)?;
        let s = g.sem(id).ok_or(WaitTimeoutError::BadObject)?;
        if self.sem_poll(&mut g, s, me) {
            return Ok(());
        }
        if let Some(t) = until {
            if t <= g.rt_time_h {
                // Already expired: undo the count effect of the failed
                // poll and report a timeout.
                self.sem_unpoll(&mut g, s);
                return Err(WaitTimeoutError::Timeout);
            }
        }
        if g.sems[s as usize].kind == SemKind::Resource {
            let owner = g.sems[s as usize].owner.unwrap();
            self.pass_prio(&mut g, owner, me);
        }
        g.tasks[me as usize].state.insert(TaskState::SEMAPHORE);
        g.tasks[me as usize].blocked_on = Some(Blocker::Sem(s));
        g.tasks[me as usize].wait_res = WaitRes::Pending;
        let order = g.sems[s as usize].order;
        {
            let SchedState { tasks, sems, .. } = &mut *g;
            wait_enq(tasks, &mut sems[s as usize].queue, me, order);
        }
        match self.block_current(g, me, until) {
            WaitRes::Ok(_) => Ok(()),
            WaitRes::Timeout => Err(WaitTimeoutError::Timeout),
            WaitRes::Closed => Err(WaitTimeoutError::Closed),
            WaitRes::Unblocked | WaitRes::Pending => Err(WaitTimeoutError::Unblocked),
        }
    }

    /// One attempt to take the semaphore without blocking. Updates the
    /// count (and ownership) on success.
    fn sem_poll(&self, g: &mut SchedState, s: u32, me: u32) -> bool {
        match g.sems[s as usize].kind {
            SemKind::Counting => {
                g.sems[s as usize].count -= 1;
                g.sems[s as usize].count >= 0
            }
            SemKind::Binary => {
                if g.sems[s as usize].count > 0 {
                    g.sems[s as usize].count = 0;
                    true
                } else {
                    false
                }
            }
            SemKind::Resource => {
                if g.sems[s as usize].owner.is_none() {
                    g.sems[s as usize].owner = Some(me);
                    g.sems[s as usize].depth = 1;
                    g.sems[s as usize].count = 0;
                    g.tasks[me as usize].owndres += MUTEX_UNIT;
                    g.tasks[me as usize].owned_sems.push(s);
                    true
                } else if g.sems[s as usize].owner == Some(me) {
                    g.sems[s as usize].depth += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A failed [`sem_poll`] on a counting semaphore leaves a
    /// speculative decrement behind; paths that do not end up waiting
    /// undo it here.
    fn sem_unpoll(&self, g: &mut SchedState, s: u32) {
        if g.sems[s as usize].kind == SemKind::Counting {
            g.sems[s as usize].count += 1;
        }
    }

    /// Drop resource ownership entirely and hand the mutex to the first
    /// waiter, with the release side of priority inheritance.
    fn res_release(&self, g: &mut SchedState, s: u32, me: u32, plan: &mut Plan) {
        g.sems[s as usize].owner = None;
        g.sems[s as usize].depth = 0;
        g.sems[s as usize].count = 1;
        g.tasks[me as usize].owndres -= MUTEX_UNIT;
        g.tasks[me as usize].owned_sems.retain(|&x| x != s);
        self.restore_inherited(g, me);
        let w = {
            let SchedState { tasks, sems, .. } = g;
            wait_pop_front(tasks, &mut sems[s as usize].queue)
        };
        if let Some(w) = w {
            g.sems[s as usize].owner = Some(w);
            g.sems[s as usize].depth = 1;
            g.sems[s as usize].count = 0;
            g.tasks[w as usize].owndres += MUTEX_UNIT;
            g.tasks[w as usize].owned_sems.push(s);
            self.wake_waiter(g, w, WaitRes::Ok(None), plan);
        }
        self.check_deferred_delete(g, me, plan);
    }

    /// Release the semaphore (V / unlock).
    pub fn sem_signal(&self, id: SemId) -> Result<(), ObjectError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let s = g.sem(id).ok_or(ObjectError::BadObject)?;
            match g.sems[s as usize].kind {
                SemKind::Counting => {
                    g.sems[s as usize].count += 1;
                    if g.sems[s as usize].count <= 0 {
                        let w = {
                            let SchedState { tasks, sems, .. } = &mut *g;
                            wait_pop_front(tasks, &mut sems[s as usize].queue)
                        };
                        if let Some(w) = w {
                            self.wake_waiter(&mut g, w, WaitRes::Ok(None), &mut plan);
                        }
                    }
                }
                SemKind::Binary => {
                    let w = {
                        let SchedState { tasks, sems, .. } = &mut *g;
                        wait_pop_front(tasks, &mut sems[s as usize].queue)
                    };
                    match w {
                        Some(w) => self.wake_waiter(&mut g, w, WaitRes::Ok(None), &mut plan),
                        None => g.sems[s as usize].count = 1,
                    }
                }
                SemKind::Resource => {
                    let me = self
                        .current_task_idx(&g)
                        .ok_or(ObjectError::NotPermitted)?;
                    if g.sems[s as usize].owner != Some(me) {
                        return Err(ObjectError::NotPermitted);
                    }
                    g.sems[s as usize].depth -= 1;
                    if g.sems[s as usize].depth > 0 {
                        return Ok(());
                    }
                    self.res_release(&mut g, s, me, &mut plan);
                }
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Wake every waiter at once; the count is left untouched for
    /// counting flavors with no waiters.
    pub fn sem_broadcast(&self, id: SemId) -> Result<(), ObjectError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let s = g.sem(id).ok_or(ObjectError::BadObject)?;
            let mut any = false;
            loop {
                let w = {
                    let SchedState { tasks, sems, .. } = &mut *g;
                    wait_pop_front(tasks, &mut sems[s as usize].queue)
                };
                let Some(w) = w else { break };
                any = true;
                self.wake_waiter(&mut g, w, WaitRes::Ok(None), &mut plan);
            }
            if any && g.sems[s as usize].kind == SemKind::Counting {
                // The released waiters' speculative decrements are void.
                g.sems[s as usize].count = 0;
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    /// Current count, for diagnostics.
    pub fn sem_count(&self, id: SemId) -> Result<i32, ObjectError> {
        let g = self.lock();
        let s = g.sem(id).ok_or(ObjectError::BadObject)?;
        Ok(g.sems[s as usize].count)
    }

    // -----------------------------------------------------------------
    // Condition variables

    /// Atomically release `mutex` (a resource semaphore owned by the
    /// caller) and wait on `cond`; on wake, re-take the mutex before
    /// returning. The mutex is restored to its recursion depth.
    pub fn cond_wait(&self, cond: CondId, mutex: SemId) -> Result<(), WaitError> {
        match self.cond_wait_core(cond, mutex, None) {
            Err(WaitTimeoutError::Timeout) => unreachable!("untimed wait timed out"),
            other => other.map_err(|e| match e {
                WaitTimeoutError::BadObject => WaitError::BadObject,
                WaitTimeoutError::Unblocked => WaitError::Unblocked,
                WaitTimeoutError::Closed => WaitError::Closed,
                WaitTimeoutError::NotPermitted => WaitError::NotPermitted,
                WaitTimeoutError::Timeout => unreachable!(),
            }),
        }
    }

    /// [`cond_wait`](Self::cond_wait) with an absolute deadline. On
    /// timeout the mutex is still re-taken before the error returns.
    pub fn cond_wait_until(
        &self,
        cond: CondId,
        mutex: SemId,
        time: Count,
    ) -> Result<(), WaitTimeoutError> {
        self.cond_wait_core(cond, mutex, Some(time))
    }

    pub fn cond_wait_timed(
        &self,
        cond: CondId,
        mutex: SemId,
        delay: Count,
    ) -> Result<(), WaitTimeoutError> {
        let t = self.get_time() + delay;
        self.cond_wait_core(cond, mutex, Some(t))
    }

    fn cond_wait_core(
        &self,
        cond: CondId,
        mutex: SemId,
        until: Option<Count>,
    ) -> Result<(), WaitTimeoutError> {
        let saved_depth;
        let res = {
            let mut g = self.lock();
            let me = self
                .current_task_idx(&g)
                .ok_or(WaitTimeoutError::NotPermitted)?;
            let c = g.cond(cond).ok_or(WaitTimeoutError::BadObject)?;
            let s = g.sem(mutex).ok_or(WaitTimeoutError::BadObject)?;
            if g.sems[s as usize].kind != SemKind::Resource
                || g.sems[s as usize].owner != Some(me)
            {
                return Err(WaitTimeoutError::NotPermitted);
            }
            // Atomically: drop the mutex (remembering its recursion
            // depth) and join the condition queue. A signal arriving the
            // instant the handed-off owner runs cannot be missed.
            let mut plan = Plan::new();
            saved_depth = g.sems[s as usize].depth;
            self.res_release(&mut g, s, me, &mut plan);
            g.tasks[me as usize].state.insert(TaskState::SEMAPHORE);
            g.tasks[me as usize].blocked_on = Some(Blocker::Cond(c));
            g.tasks[me as usize].wait_res = WaitRes::Pending;
            let order = g.conds[c as usize].order;
            {
                let SchedState { tasks, conds, .. } = &mut *g;
                wait_enq(tasks, &mut conds[c as usize].queue, me, order);
            }
            self.block_current_with(g, me, until, plan)
        };
        // Whatever happened, the caller must hold the mutex again.
        let relock = self.sem_wait(mutex);
        if relock.is_ok() && saved_depth > 1 {
            let mut g = self.lock();
            if let Some(s) = g.sem(mutex) {
                g.sems[s as usize].depth = saved_depth;
            }
        }
        match res {
            WaitRes::Ok(_) => relock.map_err(|e| match e {
                WaitError::BadObject => WaitTimeoutError::BadObject,
                WaitError::Unblocked => WaitTimeoutError::Unblocked,
                WaitError::Closed => WaitTimeoutError::Closed,
                WaitError::NotPermitted => WaitTimeoutError::NotPermitted,
            }),
            WaitRes::Timeout => Err(WaitTimeoutError::Timeout),
            WaitRes::Closed => Err(WaitTimeoutError::Closed),
            WaitRes::Unblocked | WaitRes::Pending => Err(WaitTimeoutError::Unblocked),
        }
    }

    /// Wake one waiter of the condition variable.
    pub fn cond_signal(&self, id: CondId) -> Result<(), ObjectError> {
        self.cond_wake(id, false)
    }

    /// Wake every waiter of the condition variable.
    pub fn cond_broadcast(&self, id: CondId) -> Result<(), ObjectError> {
        self.cond_wake(id, true)
    }

    fn cond_wake(&self, id: CondId, all: bool) -> Result<(), ObjectError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let c = g.cond(id).ok_or(ObjectError::BadObject)?;
            loop {
                let w = {
                    let SchedState { tasks, conds, .. } = &mut *g;
                    wait_pop_front(tasks, &mut conds[c as usize].queue)
                };
                let Some(w) = w else { break };
                self.wake_waiter(&mut g, w, WaitRes::Ok(None), &mut plan);
                if !all {
                    break;
                }
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(())
    }

    // -----------------------------------------------------------------

    /// Common wake path: clear the wait, record the outcome, make the
    /// task schedulable.
    pub(crate) fn wake_waiter(
        &self,
        g: &mut SchedState,
        idx: u32,
        res: WaitRes,
        plan: &mut Plan,
    ) {
        timed_rem(&mut g.tasks, &mut g.timed, idx);
        let t = &mut g.tasks[idx as usize];
        t.state.remove(TaskState::BLOCKED | TaskState::DELAYED);
        t.blocked_on = None;
        t.wait_res = res;
        self.make_ready(g, idx, plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TryWaitError;
    use crate::task::TaskOptions;
    use crate::testutil::{mock_exec, with_task_context};

    #[test]
    fn counting_semaphore_try_paths() {
        let exec = mock_exec(1);
        let sem = exec.sem_init(SemKind::Counting, 2, QueueOrder::Fifo).unwrap();
        with_task_context(&exec, |exec| {
            assert!(exec.sem_wait_if(sem).is_ok());
            assert!(exec.sem_wait_if(sem).is_ok());
            assert_eq!(exec.sem_wait_if(sem), Err(TryWaitError::WouldBlock));
            exec.sem_signal(sem).unwrap();
            assert!(exec.sem_wait_if(sem).is_ok());
        });
        // Two signals with no waiters land in the count.
        exec.sem_signal(sem).unwrap();
        exec.sem_signal(sem).unwrap();
        assert_eq!(exec.sem_count(sem).unwrap(), 2);
    }

    #[test]
    fn binary_semaphore_clamps() {
        let exec = mock_exec(1);
        let sem = exec.sem_init(SemKind::Binary, 1, QueueOrder::Fifo).unwrap();
        exec.sem_signal(sem).unwrap();
        exec.sem_signal(sem).unwrap();
        assert_eq!(exec.sem_count(sem).unwrap(), 1);
        with_task_context(&exec, |exec| {
            assert!(exec.sem_wait_if(sem).is_ok());
            assert_eq!(exec.sem_wait_if(sem), Err(TryWaitError::WouldBlock));
        });
        assert_eq!(exec.sem_count(sem).unwrap(), 0);
    }

    #[test]
    fn resource_mutex_recursion_and_ownership() {
        let exec = mock_exec(1);
        let mtx = exec
            .sem_init(SemKind::Resource, 1, QueueOrder::Priority)
            .unwrap();
        with_task_context(&exec, |exec| {
            exec.sem_wait_if(mtx).unwrap();
            // Recursion.
            exec.sem_wait_if(mtx).unwrap();
            {
                let g = exec.lock();
                let s = g.sem(mtx).unwrap();
                assert_eq!(g.sems[s as usize].depth, 2);
                let owner = g.sems[s as usize].owner.unwrap();
                assert_eq!(g.tasks[owner as usize].owned_mutexes(), 1);
            }
            exec.sem_signal(mtx).unwrap();
            // Still owned after the inner unlock.
            {
                let g = exec.lock();
                let s = g.sem(mtx).unwrap();
                assert!(g.sems[s as usize].owner.is_some());
            }
            exec.sem_signal(mtx).unwrap();
            let g = exec.lock();
            let s = g.sem(mtx).unwrap();
            assert_eq!(g.sems[s as usize].owner, None);
        });
    }

    #[test]
    fn delete_reports_bad_object_afterwards() {
        let exec = mock_exec(1);
        let sem = exec.sem_init(SemKind::Counting, 0, QueueOrder::Fifo).unwrap();
        exec.sem_delete(sem).unwrap();
        assert!(exec.sem_delete(sem).is_err());
        with_task_context(&exec, |exec| {
            assert_eq!(exec.sem_wait_if(sem), Err(TryWaitError::BadObject));
        });
    }
}
