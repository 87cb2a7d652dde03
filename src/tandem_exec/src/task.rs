//! Task control blocks and the intrusive queues they live on.
//!
//! TCBs are kept in one arena ([`slab::Slab`]) and referenced by small
//! indices; the public handle [`TaskId`] pairs an index with a generation
//! tag so a stale handle can never reach a recycled slot. The four lists a
//! task can be on simultaneously — the arena itself (the global task
//! list), the ready list, the timed list, and at most one blocker queue —
//! are realized as doubly-linked index lists threaded through link fields
//! embedded in the TCB. No owning pointers are ever handed out.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};

use slab::Slab;

use crate::{
    pipeline::{CtxId, FpuArea, TrapDisposition, NUM_TRAPS},
    time::{Count, TIME_END},
};

/// A scheduling priority. Smaller is higher; `0` is the highest
/// application priority. Negative values belong to the scheduler-lock
/// ladder and never appear in user calls.
pub type Priority = i32;

/// The highest application priority.
pub const HIGHEST_PRIORITY: Priority = 0;

/// The lowest application priority.
pub const LOWEST_PRIORITY: Priority = 0x3fff_ffff;

/// The priority of the per-CPU GPOS placeholder task. Below every
/// real-time task: the GPOS runs only when nothing real-time is ready.
pub const GPOS_PRIORITY: Priority = Priority::MAX;

/// `suspdepth` value marking a task whose deletion is deferred until it
/// releases the resources it owns.
pub(crate) const DELETION_PENDING: i32 = -0x7fff_ffff;

/// Hard/soft mode of a migratable task, as stored in [`TaskCb::is_hard`].
pub mod hardness {
    pub const SOFT: u8 = 0;
    pub const HARD: u8 = 1;
    pub const TRANSITIONING: u8 = 2;
}

bitflags::bitflags! {
    /// The scheduling state bitset. States compose: `READY | DELAYED`
    /// reads "will become runnable at `resume_time`".
    pub struct TaskState: u32 {
        const READY     = 1 << 0;
        const SUSPENDED = 1 << 1;
        const DELAYED   = 1 << 2;
        const SEMAPHORE = 1 << 3;
        const SEND      = 1 << 4;
        const RECEIVE   = 1 << 5;
        const RPC       = 1 << 6;
        const RETURN    = 1 << 7;
        const MBXSUSP   = 1 << 8;
        const SIGSUSP   = 1 << 9;
    }
}

impl TaskState {
    /// The bits that put a task on some blocker queue or rendezvous.
    pub const BLOCKED: TaskState = TaskState::from_bits_truncate(
        TaskState::SEMAPHORE.bits()
            | TaskState::SEND.bits()
            | TaskState::RECEIVE.bits()
            | TaskState::RPC.bits()
            | TaskState::RETURN.bits()
            | TaskState::MBXSUSP.bits()
            | TaskState::SIGSUSP.bits(),
    );
}

/// Public task handle: arena index plus generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub(crate) idx: u32,
    pub(crate) tag: u32,
}

/// What a blocked task is blocked on. The tagged replacement for an
/// opaque `blocked_on` pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Blocker {
    /// Waiting on a semaphore, mutex, or resource object.
    Sem(u32),
    /// Waiting on a condition variable.
    Cond(u32),
    /// Blocked sending to (or rpc-ing) the task with this index; the
    /// caller sits on that task's inbound message queue.
    MsgQueue(u32),
    /// Awaiting an RPC reply from the task with this index; the caller
    /// sits on that task's return queue.
    RetQueue(u32),
    /// Blocked in `receive` with no queue membership. `None` accepts any
    /// sender.
    Receive(Option<u32>),
}

/// Outcome slot written by whoever wakes a blocked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitRes {
    /// Not woken yet.
    Pending,
    /// The wait completed; for messaging, the partner. A full handle,
    /// not an index: the partner may be gone by the time the woken task
    /// gets to look.
    Ok(Option<TaskId>),
    /// The deadline passed first.
    Timeout,
    /// The partner task was destroyed.
    Unblocked,
    /// The object waited on was deleted.
    Closed,
}

/// The scalar message carrier, or a marker that the pending transfer uses
/// the extended message control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Carrier {
    Word(usize),
    Block,
}

/// Extended-message control block. One per task, reused by the single
/// outstanding blocking call; re-entrant use is rejected.
#[derive(Debug, Default)]
pub(crate) struct Mcb {
    /// Outbound payload (`sbuf`/`sbytes`).
    pub sbuf: Vec<u8>,
    /// Receiver's buffer capacity (`rbytes` requested).
    pub rcap: usize,
    /// Reply payload filled in by `returnx`.
    pub reply: Vec<u8>,
    /// Exclusivity latch for the blocking-call-in-progress.
    pub busy: bool,
}

/// Doubly-linked index-list head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub first: Option<u32>,
    pub last: Option<u32>,
}

/// Link fields embedded in a TCB, one pair per list.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Link {
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

/// Ordering discipline of a waiter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// First come, first served.
    Fifo,
    /// Sorted by task priority; FIFO among equals.
    Priority,
}

/// Per-task signal hook, run on resumption after a context switch.
pub type SignalFn = Box<dyn Fn() + Send + Sync>;

/// Per-task exit hook, run at deletion in LIFO order.
pub type ExitHook = Box<dyn FnOnce() + Send>;

/// Per-task, per-vector trap handler. Receives the vector and the GPOS
/// signal it maps to; the return value decides propagation.
pub type TrapHandler = Box<dyn Fn(usize, i32) -> TrapDisposition + Send + Sync>;

/// What occupied a per-task trap slot before an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHandlerSlot {
    WasEmpty,
    WasInstalled,
}

/// Options accepted by task creation.
pub struct TaskOptions {
    /// Stack size for the task's context. Interrupt handlers run on the
    /// stack of the task they interrupt, so leave room.
    pub stack_size: usize,
    /// Whether the task touches the FPU. The save area is only ever
    /// maintained for tasks that set this (or fault it in lazily).
    pub uses_fpu: bool,
    /// `0` selects FIFO scheduling; a positive value selects round-robin
    /// among priority peers.
    pub policy: i32,
    /// Round-robin quantum in nanoseconds (ignored under FIFO).
    pub rr_quantum_ns: i64,
    /// CPUs the task may run on.
    pub affinity: u64,
    /// Pin to one CPU at creation.
    pub cpu: Option<usize>,
    /// Optional 6-character name.
    pub name: Option<[u8; 6]>,
    /// Signal hook invoked on every resumption.
    pub signal: Option<SignalFn>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            stack_size: 16 * 1024,
            uses_fpu: false,
            policy: 0,
            rr_quantum_ns: 0,
            affinity: !0,
            cpu: None,
            name: None,
            signal: None,
        }
    }
}

/// How the task's execution context came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtxKind {
    /// A context drawn from the pipeline reservoir (a kernel task).
    Pooled,
    /// An adopted GPOS thread (the task has a twin).
    Adopted,
    /// The per-CPU GPOS placeholder; has no context of its own.
    Gpos,
}

/// One task control block.
pub(crate) struct TaskCb {
    // identity
    pub tag: u32,
    pub tid: i32,
    pub name: Option<[u8; 6]>,

    // scheduling
    pub state: TaskState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub sched_lock_priority: Priority,
    pub prio_passed_to: Option<u32>,
    pub policy: i32,
    pub rr_quantum: Count,
    pub rr_remaining: Count,
    pub yield_time: Count,

    // timing
    pub period: Count,
    pub resume_time: Count,

    // queue links
    pub rlink: Link,
    pub tlink: Link,
    pub qlink: Link,
    /// CPU currently running this task, if any. Running tasks stay on the
    /// ready list; the picker skips ones held by another CPU.
    pub running_on: Option<usize>,

    // blocking
    pub blocked_on: Option<Blocker>,
    pub wait_res: WaitRes,

    // messaging
    pub msg: Carrier,
    /// Inbound senders blocked on this task.
    pub msgq: ListHead,
    /// RPC callers awaiting this task's reply.
    pub retq: ListHead,
    pub mcb: Mcb,
    /// Composite resource counter: high half counts owned resource
    /// mutexes (drives priority inheritance), low half counts RPCs owed.
    pub owndres: u32,
    /// Resource semaphores currently owned, for exact priority restore.
    pub owned_sems: Vec<u32>,

    // lifecycle
    pub suspdepth: i32,
    /// Deleted, slot kept only until the backing context notices.
    pub zombie: bool,
    pub exit_hooks: Vec<ExitHook>,
    pub signal_fn: Option<SignalFn>,
    pub trap_handlers: [Option<TrapHandler>; NUM_TRAPS],

    // FPU
    pub uses_fpu: bool,
    pub fpu_area: FpuArea,

    // placement
    pub affinity: u64,
    pub stack_size: usize,

    // context / migration
    pub ctx: Option<CtxId>,
    pub ctx_kind: CtxKind,
    pub is_hard: AtomicU8,
    pub force_soft: AtomicBool,
    /// Signal number recorded for the twin on forced demotion.
    pub pending_signal: Option<i32>,

    // proxy
    pub proxy: Option<ProxyCtl>,

    // accounting
    pub exectime: AtomicU64,
}

/// State of a proxy task.
#[derive(Debug)]
pub(crate) struct ProxyCtl {
    pub receiver: TaskId,
    pub payload: Vec<u8>,
    pub nmsgs: u32,
}

impl TaskCb {
    pub fn new(tag: u32, tid: i32, priority: Priority, ctx_kind: CtxKind) -> Self {
        const NO_HANDLER: Option<TrapHandler> = None;
        Self {
            tag,
            tid,
            name: None,
            state: TaskState::READY | TaskState::SUSPENDED,
            priority,
            base_priority: priority,
            sched_lock_priority: 0,
            prio_passed_to: None,
            policy: 0,
            rr_quantum: 0,
            rr_remaining: 0,
            yield_time: 0,
            period: 0,
            resume_time: TIME_END,
            rlink: Link::default(),
            tlink: Link::default(),
            qlink: Link::default(),
            running_on: None,
            blocked_on: None,
            wait_res: WaitRes::Pending,
            msg: Carrier::Word(0),
            msgq: ListHead::default(),
            retq: ListHead::default(),
            mcb: Mcb::default(),
            owndres: 0,
            owned_sems: Vec::new(),
            suspdepth: 1,
            zombie: false,
            exit_hooks: Vec::new(),
            signal_fn: None,
            trap_handlers: [NO_HANDLER; NUM_TRAPS],
            uses_fpu: false,
            fpu_area: FpuArea::default(),
            affinity: !0,
            stack_size: 0,
            ctx: None,
            ctx_kind,
            is_hard: AtomicU8::new(hardness::HARD),
            force_soft: AtomicBool::new(false),
            pending_signal: None,
            proxy: None,
            exectime: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn id(&self, idx: u32) -> TaskId {
        TaskId {
            idx,
            tag: self.tag,
        }
    }

    #[inline]
    pub fn owned_mutexes(&self) -> u32 {
        self.owndres >> 16
    }

    #[inline]
    pub fn pending_rpcs(&self) -> u32 {
        self.owndres & 0xffff
    }
}

pub(crate) const MUTEX_UNIT: u32 = 1 << 16;
pub(crate) const RPC_UNIT: u32 = 1;

// ---------------------------------------------------------------------------
// List disciplines.
//
// Each function receives the arena and the list head; heads stored inside
// a TCB (msgq / retq) are `mem::take`n out around the call.

/// Insert into the ready list: before the first task with a strictly
/// greater priority number, so equal priorities stay FIFO.
pub(crate) fn ready_enq(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32) {
    let prio = tasks[idx as usize].priority;
    let mut at = head.first;
    while let Some(i) = at {
        if tasks[i as usize].priority > prio {
            break;
        }
        at = tasks[i as usize].rlink.next;
    }
    insert_before(tasks, head, idx, at, |t| &mut t.rlink);
}

pub(crate) fn ready_rem(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32) {
    remove(tasks, head, idx, |t| &mut t.rlink);
}

/// Insert into the timed list, ordered by `resume_time` ascending.
pub(crate) fn timed_enq(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32) {
    let t = tasks[idx as usize].resume_time;
    let mut at = head.first;
    while let Some(i) = at {
        if tasks[i as usize].resume_time > t {
            break;
        }
        at = tasks[i as usize].tlink.next;
    }
    insert_before(tasks, head, idx, at, |t| &mut t.tlink);
}

/// Remove from the timed list if present. Harmless on tasks that are not
/// delayed, which keeps wake-up paths free of case analysis.
pub(crate) fn timed_rem(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32) {
    if tasks[idx as usize].state.contains(TaskState::DELAYED)
        || head.first == Some(idx)
        || tasks[idx as usize].tlink.prev.is_some()
        || tasks[idx as usize].tlink.next.is_some()
    {
        remove(tasks, head, idx, |t| &mut t.tlink);
    }
}

/// Enqueue on a blocker queue per the queue's discipline.
pub(crate) fn wait_enq(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32, order: QueueOrder) {
    let at = match order {
        QueueOrder::Fifo => None,
        QueueOrder::Priority => {
            let prio = tasks[idx as usize].priority;
            let mut at = head.first;
            loop {
                match at {
                    Some(i) if tasks[i as usize].priority <= prio => {
                        at = tasks[i as usize].qlink.next;
                    }
                    other => break other,
                }
            }
        }
    };
    insert_before(tasks, head, idx, at, |t| &mut t.qlink);
}

pub(crate) fn wait_rem(tasks: &mut Slab<TaskCb>, head: &mut ListHead, idx: u32) {
    remove(tasks, head, idx, |t| &mut t.qlink);
}

pub(crate) fn wait_pop_front(tasks: &mut Slab<TaskCb>, head: &mut ListHead) -> Option<u32> {
    let idx = head.first?;
    remove(tasks, head, idx, |t| &mut t.qlink);
    Some(idx)
}

fn insert_before(
    tasks: &mut Slab<TaskCb>,
    head: &mut ListHead,
    idx: u32,
    before: Option<u32>,
    link: impl Fn(&mut TaskCb) -> &mut Link,
) {
    match before {
        None => {
            // Append at the tail.
            let prev = head.last;
            *link(&mut tasks[idx as usize]) = Link { prev, next: None };
            match prev {
                Some(p) => link(&mut tasks[p as usize]).next = Some(idx),
                None => head.first = Some(idx),
            }
            head.last = Some(idx);
        }
        Some(nxt) => {
            let prev = link(&mut tasks[nxt as usize]).prev;
            *link(&mut tasks[idx as usize]) = Link {
                prev,
                next: Some(nxt),
            };
            link(&mut tasks[nxt as usize]).prev = Some(idx);
            match prev {
                Some(p) => link(&mut tasks[p as usize]).next = Some(idx),
                None => head.first = Some(idx),
            }
        }
    }
}

fn remove(
    tasks: &mut Slab<TaskCb>,
    head: &mut ListHead,
    idx: u32,
    link: impl Fn(&mut TaskCb) -> &mut Link,
) {
    let Link { prev, next } = *link(&mut tasks[idx as usize]);
    match prev {
        Some(p) => link(&mut tasks[p as usize]).next = next,
        None => {
            if head.first == Some(idx) {
                head.first = next;
            } else {
                // Not on this list at all.
                debug_assert!(next.is_none());
                return;
            }
        }
    }
    match next {
        Some(n) => link(&mut tasks[n as usize]).prev = prev,
        None => {
            if head.last == Some(idx) {
                head.last = prev;
            }
        }
    }
    *link(&mut tasks[idx as usize]) = Link::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(tasks: &mut Slab<TaskCb>, prio: Priority) -> u32 {
        let entry = tasks.vacant_entry();
        let idx = entry.key() as u32;
        entry.insert(TaskCb::new(1, idx as i32, prio, CtxKind::Pooled));
        idx
    }

    fn collect(tasks: &Slab<TaskCb>, head: &ListHead, link: impl Fn(&TaskCb) -> Link) -> Vec<u32> {
        let mut v = Vec::new();
        let mut at = head.first;
        while let Some(i) = at {
            v.push(i);
            at = link(&tasks[i as usize]).next;
        }
        v
    }

    #[test]
    fn ready_orders_by_priority_fifo_ties() {
        let mut tasks = Slab::new();
        let mut head = ListHead::default();
        let a = mk(&mut tasks, 5);
        let b = mk(&mut tasks, 3);
        let c = mk(&mut tasks, 5);
        let d = mk(&mut tasks, 1);
        for i in [a, b, c, d] {
            ready_enq(&mut tasks, &mut head, i);
        }
        assert_eq!(collect(&tasks, &head, |t| t.rlink), vec![d, b, a, c]);

        ready_rem(&mut tasks, &mut head, b);
        assert_eq!(collect(&tasks, &head, |t| t.rlink), vec![d, a, c]);

        // Yield repositioning: remove and re-insert lands behind the peer.
        ready_rem(&mut tasks, &mut head, a);
        ready_enq(&mut tasks, &mut head, a);
        assert_eq!(collect(&tasks, &head, |t| t.rlink), vec![d, c, a]);
    }

    #[test]
    fn timed_orders_by_resume_time() {
        let mut tasks = Slab::new();
        let mut head = ListHead::default();
        let a = mk(&mut tasks, 0);
        let b = mk(&mut tasks, 0);
        let c = mk(&mut tasks, 0);
        tasks[a as usize].resume_time = 300;
        tasks[b as usize].resume_time = 100;
        tasks[c as usize].resume_time = 200;
        for i in [a, b, c] {
            tasks[i as usize].state.insert(TaskState::DELAYED);
            timed_enq(&mut tasks, &mut head, i);
        }
        assert_eq!(collect(&tasks, &head, |t| t.tlink), vec![b, c, a]);

        timed_rem(&mut tasks, &mut head, c);
        assert_eq!(collect(&tasks, &head, |t| t.tlink), vec![b, a]);

        // Removing a task that is not delayed is a no-op.
        let d = mk(&mut tasks, 0);
        timed_rem(&mut tasks, &mut head, d);
        assert_eq!(collect(&tasks, &head, |t| t.tlink), vec![b, a]);
    }

    #[test]
    fn wait_queue_priority_discipline() {
        let mut tasks = Slab::new();
        let mut head = ListHead::default();
        let lo = mk(&mut tasks, 9);
        let hi = mk(&mut tasks, 1);
        let mid = mk(&mut tasks, 4);
        let hi2 = mk(&mut tasks, 1);
        for i in [lo, hi, mid, hi2] {
            wait_enq(&mut tasks, &mut head, i, QueueOrder::Priority);
        }
        assert_eq!(collect(&tasks, &head, |t| t.qlink), vec![hi, hi2, mid, lo]);
        assert_eq!(wait_pop_front(&mut tasks, &mut head), Some(hi));
        assert_eq!(wait_pop_front(&mut tasks, &mut head), Some(hi2));
    }

    #[test]
    fn wait_queue_fifo_discipline() {
        let mut tasks = Slab::new();
        let mut head = ListHead::default();
        let a = mk(&mut tasks, 9);
        let b = mk(&mut tasks, 1);
        wait_enq(&mut tasks, &mut head, a, QueueOrder::Fifo);
        wait_enq(&mut tasks, &mut head, b, QueueOrder::Fifo);
        assert_eq!(wait_pop_front(&mut tasks, &mut head), Some(a));
        assert_eq!(wait_pop_front(&mut tasks, &mut head), Some(b));
        assert_eq!(wait_pop_front(&mut tasks, &mut head), None);
    }

    #[test]
    fn owndres_halves() {
        let mut t = TaskCb::new(1, 1, 0, CtxKind::Pooled);
        t.owndres += MUTEX_UNIT;
        t.owndres += MUTEX_UNIT;
        t.owndres += RPC_UNIT;
        assert_eq!(t.owned_mutexes(), 2);
        assert_eq!(t.pending_rpcs(), 1);
    }
}
