//! The timer service.
//!
//! Two operating modes, chosen before [`Executive::start_timer`]:
//!
//!  - **Periodic**: the hardware re-raises the timer vector at a fixed
//!    interval. Each tick advances `tick_time` by the period, wakes every
//!    timed task due within the half-tick tolerance, and replays the GPOS
//!    tick downstream when it falls due.
//!
//!  - **One-shot**: every expiry reads the CPU counter and programs the
//!    next deadline as the earliest of the next GPOS tick, the earliest
//!    `resume_time` among timed tasks at or above the priority about to
//!    run, and the round-robin yield deadline. The programmed delay is
//!    reduced by the calibrated dispatch latency; a delay below the
//!    re-arm setup cost is pushed out to the setup cost instead, because
//!    the chip cannot be programmed any closer.
//!
//! The GPOS keeps its own time: whenever `tick_time` crosses
//! `linux_time`, the timer vector is pended to the GPOS stage, so the
//! GPOS tick count advances at its natural rate even while the RT layer
//! owns the hardware.
use std::sync::{Arc, Weak};

use crate::{
    error::TimerError,
    exec::{Executive, TIMER_VEC},
    pipeline::Pipeline,
    sched::Plan,
    task::GPOS_PRIORITY,
    time::{Count, TimerMode},
    utils::scale64,
};

impl<P: Pipeline> Executive<P> {
    /// Select periodic timer operation (the default). Stops a running
    /// timer first.
    pub fn set_periodic_mode(&self) {
        let _ = self.stop_timer();
        self.lock().timer_mode = TimerMode::Periodic;
    }

    /// Select one-shot timer operation. Stops a running timer first.
    pub fn set_oneshot_mode(&self) {
        let _ = self.stop_timer();
        self.lock().timer_mode = TimerMode::Oneshot;
    }

    /// Whether the RT layer currently owns the hardware timer.
    pub fn is_hard_timer_running(&self) -> bool {
        self.lock().timer_running
    }

    /// In one-shot mode, always keep a shot armed even when the GPOS
    /// placeholder is about to run.
    pub fn preempt_always(&self, yes: bool) {
        self.lock().preempt_always = yes;
    }

    /// Take over the hardware timer and start dispatching time.
    ///
    /// `period` is in internal counts and only meaningful in periodic
    /// mode, where it is clamped to the GPOS tick latch; the effective
    /// period is returned. In one-shot mode the argument is ignored.
    pub fn start_timer(self: &Arc<Self>, period: Count) -> Result<Count, TimerError> {
        let effective;
        {
            let mut g = self.lock();
            if g.timer_running {
                return Err(TimerError::Busy);
            }
            let now_cpu = self.pipeline.read_cpu_counts();
            let latch = self.pipeline.gpos_tick_latch();
            match g.timer_mode {
                TimerMode::Oneshot => {
                    self.pipeline
                        .grab_timer(TIMER_VEC, None)
                        .map_err(|_| TimerError::Busy)?;
                    g.tuned.half_tick = g.tuned.latency_cpu_units;
                    // The GPOS tick expressed in CPU counts.
                    let linux_tick =
                        scale64(latch, g.base.cpu_freq as i64, g.base.timer_freq as i64);
                    for cs in g.cpus.iter_mut() {
                        cs.rt_times.linux_tick = linux_tick;
                        cs.rt_times.periodic_tick = linux_tick;
                        cs.rt_times.tick_time = now_cpu;
                        cs.rt_times.linux_time = now_cpu + linux_tick;
                        cs.rt_times.intr_time = now_cpu + linux_tick;
                        cs.shot_fired = true;
                    }
                    // The first shot lands on the next GPOS tick; every
                    // later one is computed by the scheduler.
                    self.pipeline.program_shot(latch);
                    effective = period;
                }
                TimerMode::Periodic => {
                    if period <= 0 {
                        return Err(TimerError::BadParam);
                    }
                    let tick = period.min(latch);
                    self.pipeline
                        .grab_timer(TIMER_VEC, Some(tick))
                        .map_err(|_| TimerError::Busy)?;
                    g.tuned.half_tick = (tick + 1) >> 1;
                    // Periodic counts are timer units.
                    let now = scale64(now_cpu, g.base.timer_freq as i64, g.base.cpu_freq as i64);
                    for cs in g.cpus.iter_mut() {
                        cs.rt_times.linux_tick = latch;
                        cs.rt_times.periodic_tick = tick;
                        cs.rt_times.tick_time = now;
                        cs.rt_times.linux_time = now + latch;
                        cs.rt_times.intr_time = now + tick;
                        cs.shot_fired = false;
                    }
                    effective = tick;
                }
            }
            g.rt_time_h = g.cpus[0].rt_times.tick_time + g.tuned.half_tick;
            g.timer_running = true;
        }

        // The RT-stage expiry handler.
        let w = Arc::downgrade(self);
        self.request_irq(TIMER_VEC, true, move |_vec| {
            if let Some(exec) = Weak::upgrade(&w) {
                exec.timer_tick();
            }
            true
        })
        .map_err(|_| TimerError::Busy)?;

        // The GPOS-stage side keeps the GPOS tick honest when the
        // replayed vector plays out of order.
        let w = Arc::downgrade(self);
        let _ = self.pipeline.register_gpos_handler(
            TIMER_VEC,
            Arc::new(move || {
                if let Some(exec) = Weak::upgrade(&w) {
                    exec.recover_gpos_tick();
                }
            }),
        );

        log::debug!("timer started, effective period {effective}");
        Ok(effective)
    }

    /// Release the hardware timer and let the GPOS tick run at its
    /// natural rate again. The pipeline drains any in-flight expiry
    /// before this returns.
    pub fn stop_timer(&self) -> Result<(), TimerError> {
        {
            let mut g = self.lock();
            if !g.timer_running {
                return Err(TimerError::NotPermitted);
            }
            g.timer_running = false;
            for cs in g.cpus.iter_mut() {
                cs.shot_fired = false;
            }
        }
        self.pipeline.release_timer();
        self.release_irq(TIMER_VEC);
        self.pipeline.unregister_gpos_handler(TIMER_VEC);
        log::debug!("timer stopped");
        Ok(())
    }

    /// The RT-stage timer expiry body. Runs in interrupt context; the
    /// switch it provokes is applied at dispatch exit.
    pub(crate) fn timer_tick(&self) {
        let cpu = self.pipeline.current_cpu();
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            if !g.timer_running {
                return;
            }
            let oneshot = g.timer_mode == TimerMode::Oneshot;

            {
                let times = &mut g.cpus[cpu].rt_times;
                times.tick_time = if oneshot {
                    self.pipeline.read_cpu_counts()
                } else {
                    times.intr_time
                };
            }
            g.rt_time_h = g.cpus[cpu].rt_times.tick_time + g.tuned.half_tick;
            if g.cpus[cpu].rt_times.tick_time >= g.cpus[cpu].rt_times.linux_time {
                g.cpus[cpu].rt_times.linux_time += g.cpus[cpu].rt_times.linux_tick;
                self.pipeline.pend_to_gpos(TIMER_VEC);
            }

            self.wake_up_timed_tasks(&mut g, &mut plan);

            if oneshot {
                let next = self.pick(&g, cpu);
                let prio = g.tasks[next as usize].priority;
                {
                    let times = &mut g.cpus[cpu].rt_times;
                    times.intr_time = if times.linux_time > times.tick_time {
                        times.linux_time
                    } else {
                        times.tick_time + times.linux_tick
                    };
                }
                let mut preempt = if g.tasks[next as usize].policy > 0 {
                    let yt = g.tasks[next as usize].yield_time;
                    if yt < g.cpus[cpu].rt_times.intr_time {
                        g.cpus[cpu].rt_times.intr_time = yt;
                    }
                    true
                } else {
                    g.preempt_always || prio == GPOS_PRIORITY
                };
                let mut at = g.timed.first;
                while let Some(i) = at {
                    let t = &g.tasks[i as usize];
                    if t.priority <= prio && t.resume_time < g.cpus[cpu].rt_times.intr_time {
                        g.cpus[cpu].rt_times.intr_time = t.resume_time;
                        preempt = true;
                        break;
                    }
                    at = t.tlink.next;
                }
                g.cpus[cpu].shot_fired = preempt;
                if preempt {
                    self.arm_shot(&mut g, cpu, &mut plan);
                }
            } else {
                g.cpus[cpu].rt_times.intr_time += g.cpus[cpu].rt_times.periodic_tick;
            }

            // Request the switch; it happens at dispatch exit.
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        self.run_plan(plan);
    }

    /// GPOS-stage companion of the replayed tick: if the RT side ran
    /// ahead, advance the GPOS deadline so ticks are not double-counted.
    pub(crate) fn recover_gpos_tick(&self) {
        let mut g = self.lock();
        for cs in g.cpus.iter_mut() {
            if cs.rt_times.tick_time >= cs.rt_times.linux_time {
                cs.rt_times.linux_time += cs.rt_times.linux_tick;
            }
        }
    }

    // -----------------------------------------------------------------
    // Clock reads and conversions

    /// The current time in internal counts of the active mode.
    pub fn get_time(&self) -> Count {
        let g = self.lock();
        match g.timer_mode {
            TimerMode::Oneshot => self.pipeline.read_cpu_counts(),
            TimerMode::Periodic => {
                if g.timer_running {
                    g.cpus[self.pipeline.current_cpu()].rt_times.tick_time
                } else {
                    scale64(
                        self.pipeline.read_cpu_counts(),
                        g.base.timer_freq as i64,
                        g.base.cpu_freq as i64,
                    )
                }
            }
        }
    }

    /// The current time in nanoseconds.
    pub fn get_time_ns(&self) -> i64 {
        let mode = self.lock().timer_mode;
        let counts = self.get_time();
        self.lock().base.count2nano(mode, counts)
    }

    /// Convert nanoseconds to internal counts of the active mode.
    pub fn nano2count(&self, ns: i64) -> Count {
        let g = self.lock();
        g.base.nano2count(g.timer_mode, ns)
    }

    /// Convert internal counts of the active mode to nanoseconds.
    pub fn count2nano(&self, counts: Count) -> i64 {
        let g = self.lock();
        g.base.count2nano(g.timer_mode, counts)
    }

    /// A convenience for tests and skins: the half-tick tolerance in
    /// effect.
    pub fn half_tick(&self) -> Count {
        self.lock().tuned.half_tick
    }
}
