//! # tandem_exec
//!
//! The core of a hard real-time executive that cooperates with a commodity
//! general-purpose OS (the *GPOS*). The executive owns a privileged
//! interrupt-dispatch stage ahead of the GPOS, so real-time tasks preempt
//! every GPOS activity, including sections where the GPOS has masked
//! interrupts.
//!
//! This crate contains the machine-independent core: the priority-based
//! preemptive scheduler, the timer service, the dual-domain IRQ dispatch
//! table, resource primitives with priority inheritance, the synchronous
//! messaging layer (send / receive / rpc / return), proxy tasks, the
//! hard/soft migration machinery, trap routing, and the feature registry.
//!
//! Everything that touches the machine or the host is reached through the
//! *Pipeline Domain Interface* — the [`Pipeline`] trait family in
//! [`pipeline`] — implemented elsewhere (see the `tandem_pipeline_std`
//! crate for a hosted Unix implementation).
//!
//! # Contexts
//!
//! Code calls into the executive from one of three contexts:
//!
//!  - **hard task context** — a task scheduled by the executive itself;
//!  - **soft task context** — a GPOS thread that registered a task control
//!    block and calls executive APIs while remaining under GPOS scheduling;
//!  - **interrupt context** — an RT-domain interrupt handler.
//!
//! Blocking operations require a task context. Interrupt handlers may only
//! use the non-blocking (`_if`) variants and wake-up operations.
//!
//! # Priorities
//!
//! One orientation is used everywhere: **a smaller number means a higher
//! priority**. `0` is the highest application priority, and the GPOS
//! placeholder task sits at [`GPOS_PRIORITY`], below every real-time task.
//! Negative priorities are reserved for the scheduler-lock ladder.
pub mod error;
pub mod exec;
pub mod irq;
pub mod migrate;
pub mod msg;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod sched;
pub mod sem;
pub mod task;
pub mod time;
pub mod timer;
pub mod trap;
pub mod utils;

#[cfg(test)]
mod testutil;

pub use crate::{
    error::*,
    exec::{Config, Executive},
    pipeline::{
        CtxId, DomainHooks, DomainId, FpuArea, GposEvent, IrqVec, Pipeline, PipelineError, Stage,
        TrapDisposition, NUM_TRAPS, NUM_VECTORS,
    },
    registry::{argdesc, FunEntry, NUM_FUN_SLOTS},
    sem::{CondId, SemId, SemKind},
    task::{
        Priority, QueueOrder, TaskHandlerSlot, TaskId, TaskOptions, TaskState, GPOS_PRIORITY,
        HIGHEST_PRIORITY, LOWEST_PRIORITY,
    },
    time::{Count, TimerMode, TIME_END},
    trap::TRAP_FPU_UNAVAILABLE,
};
