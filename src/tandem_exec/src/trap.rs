//! Fault and trap routing.
//!
//! Every CPU exception is caught in the RT domain first. The routing
//! order is fixed: events taken on the GPOS stage (or by a soft task)
//! propagate downstream untouched; a task-installed handler gets the
//! next say; the FPU-unavailable fault turns into a lazy FPU hand-off;
//! and a hard task with nothing else left is forcibly demoted so the
//! GPOS can deliver the natural signal.
use crate::{
    error::TaskError,
    exec::Executive,
    pipeline::{Pipeline, TrapDisposition, NUM_TRAPS},
    task::{hardness, TaskHandlerSlot, TaskId, TrapHandler},
};
use std::sync::atomic::Ordering;

/// The x86 "device not available" vector, promoted to a lazy FPU
/// restore.
pub const TRAP_FPU_UNAVAILABLE: usize = 7;

/// GPOS signal numbers the trap vectors map to when a fault must be
/// delivered to the twin. Indexed by vector.
pub(crate) const TRAP_TO_SIGNAL: [i32; NUM_TRAPS] = {
    const SIGILL: i32 = 4;
    const SIGTRAP: i32 = 5;
    const SIGBUS: i32 = 7;
    const SIGFPE: i32 = 8;
    const SIGSEGV: i32 = 11;
    let mut t = [0i32; NUM_TRAPS];
    t[0] = SIGFPE; // divide error
    t[1] = SIGTRAP; // debug
    t[2] = SIGSEGV; // NMI
    t[3] = SIGTRAP; // breakpoint
    t[4] = SIGSEGV; // overflow
    t[5] = SIGSEGV; // bounds
    t[6] = SIGILL; // invalid opcode
    t[7] = SIGSEGV; // device not available
    t[8] = SIGSEGV; // double fault
    t[9] = SIGFPE; // coprocessor segment overrun
    t[10] = SIGSEGV; // invalid TSS
    t[11] = SIGBUS; // segment not present
    t[12] = SIGBUS; // stack segment
    t[13] = SIGSEGV; // general protection
    t[14] = SIGSEGV; // page fault
    t[16] = SIGFPE; // coprocessor error
    t[17] = SIGBUS; // alignment check
    t[18] = SIGSEGV; // reserved
    t[19] = SIGFPE; // XMM fault
    t
};

impl<P: Pipeline> Executive<P> {
    /// Install a per-task trap handler for `vec`; returns the previous
    /// slot occupancy.
    pub fn set_task_trap_handler(
        &self,
        id: TaskId,
        vec: usize,
        handler: Option<TrapHandler>,
    ) -> Result<TaskHandlerSlot, TaskError> {
        if vec >= NUM_TRAPS {
            return Err(TaskError::NotPermitted);
        }
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        let had = g.tasks[idx as usize].trap_handlers[vec].is_some();
        g.tasks[idx as usize].trap_handlers[vec] = handler;
        Ok(if had {
            TaskHandlerSlot::WasInstalled
        } else {
            TaskHandlerSlot::WasEmpty
        })
    }

    /// The RT domain's trap catcher, registered with the pipeline at
    /// bring-up. Runs on the faulting thread.
    pub(crate) fn dispatch_trap(&self, cpu: usize, vec: usize) -> TrapDisposition {
        if vec >= NUM_TRAPS {
            return TrapDisposition::Propagate;
        }
        let me = {
            let g = self.lock();
            // Faults on the GPOS stage are none of our business.
            if g.cpus[cpu].current == g.cpus[cpu].gpos {
                return TrapDisposition::Propagate;
            }
            match self.current_task_idx(&g) {
                Some(idx) => idx,
                None => return TrapDisposition::Propagate,
            }
        };

        // A soft task faults under GPOS rules.
        let (is_soft, signo) = {
            let g = self.lock();
            let t = &g.tasks[me as usize];
            (
                t.is_hard.load(Ordering::Acquire) == hardness::SOFT,
                TRAP_TO_SIGNAL[vec],
            )
        };
        if is_soft {
            return TrapDisposition::Propagate;
        }

        // Per-task handler gets the next say.
        let handler = {
            let mut g = self.lock();
            g.tasks[me as usize].trap_handlers[vec].take()
        };
        if let Some(h) = handler {
            let disp = h(vec, signo);
            let mut g = self.lock();
            if let Some(t) = g.tasks.get_mut(me as usize) {
                if t.trap_handlers[vec].is_none() {
                    t.trap_handlers[vec] = Some(h);
                }
            }
            if disp == TrapDisposition::Handled {
                return TrapDisposition::Handled;
            }
        }

        // The FPU trap is not a fault at all: hand the unit over lazily.
        if vec == TRAP_FPU_UNAVAILABLE {
            self.lazy_fpu_switch(cpu, me);
            return TrapDisposition::Handled;
        }

        // A hard task took a real fault: demote it and let the GPOS
        // signal path take over.
        log::warn!(
            "unhandled trap {vec} in hard task; demoting and raising signal {signo}"
        );
        {
            let mut g = self.lock();
            g.tasks[me as usize].pending_signal = Some(signo);
        }
        self.demote_current();
        TrapDisposition::Handled
    }

    /// Promote `me` to FPU owner on `cpu`: save the previous owner's
    /// context, restore ours, clear the disable bit.
    fn lazy_fpu_switch(&self, cpu: usize, me: u32) {
        let mut g = self.lock();
        g.tasks[me as usize].uses_fpu = true;
        self.pipeline.set_fpu_disable_bit(cpu, false);
        if g.cpus[cpu].fpu_owner != me {
            let owner = g.cpus[cpu].fpu_owner;
            self.pipeline
                .fpu_save(cpu, &mut g.tasks[owner as usize].fpu_area);
            g.cpus[cpu].fpu_owner = me;
            self.pipeline
                .fpu_restore(cpu, &g.tasks[me as usize].fpu_area);
        }
        log::trace!("lazy fpu hand-off to task {}", g.tasks[me as usize].tid);
    }

    /// Raise a CPU exception on the calling thread, as the pipeline's
    /// trap catcher would. The entry point used by hosted fault
    /// injection.
    pub fn raise_trap(&self, vec: usize) -> TrapDisposition {
        let cpu = self.pipeline.current_cpu();
        self.dispatch_trap(cpu, vec)
    }

    /// The signal recorded for a task's twin by a forced demotion, if
    /// any. Reading consumes it, like the GPOS delivering the signal.
    pub fn take_pending_signal(&self, id: TaskId) -> Result<Option<i32>, TaskError> {
        let mut g = self.lock();
        let idx = g.resolve(id).ok_or(TaskError::BadTask)?;
        Ok(g.tasks[idx as usize].pending_signal.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_signal_table_covers_known_faults() {
        assert_eq!(TRAP_TO_SIGNAL[0], 8); // divide -> SIGFPE
        assert_eq!(TRAP_TO_SIGNAL[6], 4); // ud2 -> SIGILL
        assert_eq!(TRAP_TO_SIGNAL[14], 11); // page fault -> SIGSEGV
        assert_eq!(TRAP_TO_SIGNAL[15], 0); // spurious: nothing
    }
}
