//! Tuned constants and the time base.
//!
//! # Units
//!
//! The executive keeps time in **internal counts** (`Count`). What a count
//! measures depends on the timer mode:
//!
//!  - in **one-shot** mode, counts are CPU time-stamp units (the TSC on
//!    x86), because deadlines are computed against the free-running CPU
//!    counter;
//!  - in **periodic** mode, counts are hardware-timer units, because every
//!    deadline is a multiple of the programmed tick.
//!
//! Conversions therefore carry a "which base" flag ([`TimerMode`]) and are
//! provided both ways with signed round-toward-zero semantics.
//!
//! # Tuned constants
//!
//! Real hardware pays a latency between a timer shot and the scheduler
//! actually running, and a setup cost to re-arm a one-shot timer chip.
//! Both are measured (or supplied by configuration) in nanoseconds and
//! folded into count-unit constants once at bring-up; the hot paths only
//! ever subtract precomputed integers.
use crate::utils::scale64;

/// A point or span of time in internal counts. Signed, like the source
/// material: deadline arithmetic deliberately goes negative when a
/// deadline is already in the past.
pub type Count = i64;

/// "Never": the resume time of a task that is not timed.
pub const TIME_END: Count = Count::MAX;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Hardware-timer operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fixed-interval tick; counts are hardware-timer units.
    Periodic,
    /// Variable-interval deadline mode; counts are CPU units.
    Oneshot,
}

/// Calibrated frequencies of the two count bases.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    /// CPU time-stamp counter frequency in Hz.
    pub cpu_freq: u64,
    /// Hardware timer frequency in Hz.
    pub timer_freq: u64,
}

impl TimeBase {
    /// Convert nanoseconds to internal counts for the given mode.
    #[inline]
    pub fn nano2count(&self, mode: TimerMode, ns: i64) -> Count {
        match mode {
            TimerMode::Oneshot => scale64(ns, self.cpu_freq as i64, NANOS_PER_SEC),
            TimerMode::Periodic => scale64(ns, self.timer_freq as i64, NANOS_PER_SEC),
        }
    }

    /// Convert internal counts to nanoseconds for the given mode.
    #[inline]
    pub fn count2nano(&self, mode: TimerMode, counts: Count) -> i64 {
        match mode {
            TimerMode::Oneshot => scale64(counts, NANOS_PER_SEC, self.cpu_freq as i64),
            TimerMode::Periodic => scale64(counts, NANOS_PER_SEC, self.timer_freq as i64),
        }
    }

    /// Convert CPU counts to hardware-timer counts.
    #[inline]
    pub fn cpu2timer(&self, counts: Count) -> Count {
        scale64(counts, self.timer_freq as i64, self.cpu_freq as i64)
    }
}

/// Derived per-boot constants, all in internal counts.
#[derive(Debug, Clone, Copy)]
pub struct TunedConstants {
    /// Worst-case interrupt-to-scheduler latency, CPU units. Subtracted
    /// from every programmed one-shot delay so the scheduler runs *at*
    /// the deadline rather than after it.
    pub latency_cpu_units: Count,
    /// Worst-case one-shot re-arm setup time, CPU units. A shot closer
    /// than this cannot be honored; the deadline is pushed this far out
    /// instead.
    pub setup_cpu_units: Count,
    /// The same setup time expressed in hardware-timer units, which is
    /// what actually gets programmed when the deadline had to be pushed.
    pub setup_timer_units: Count,
    /// Half of the effective tick. Added to the current time when
    /// comparing against `resume_time` so a wake-up scheduled a hair
    /// after the tick does not slip a whole period ("double-shot"
    /// avoidance).
    pub half_tick: Count,
}

impl TunedConstants {
    /// Fold nanosecond calibration inputs into count-unit constants.
    ///
    /// `half_tick` starts at the one-shot value (the latency); starting a
    /// periodic timer replaces it with half the effective tick.
    pub fn derive(base: &TimeBase, latency_ns: i64, setup_time_ns: i64) -> Self {
        let latency_cpu_units = base.nano2count(TimerMode::Oneshot, latency_ns);
        Self {
            latency_cpu_units,
            setup_cpu_units: base.nano2count(TimerMode::Oneshot, setup_time_ns),
            setup_timer_units: base.nano2count(TimerMode::Periodic, setup_time_ns),
            half_tick: latency_cpu_units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn base() -> TimeBase {
        TimeBase {
            cpu_freq: 1_000_000_000,
            timer_freq: 1_000_000_000,
        }
    }

    #[test]
    fn derive_folds_both_bases() {
        let base = TimeBase {
            cpu_freq: 2_000_000_000,
            timer_freq: 1_193_180,
        };
        let tuned = TunedConstants::derive(&base, 4_000, 2_500);
        assert_eq!(tuned.latency_cpu_units, 8_000);
        assert_eq!(tuned.setup_cpu_units, 5_000);
        // 2500ns at 1.19318 MHz is just shy of 3 counts; truncation keeps 2.
        assert_eq!(tuned.setup_timer_units, 2);
        assert_eq!(tuned.half_tick, tuned.latency_cpu_units);
    }

    #[quickcheck]
    fn quickcheck_round_trip_at_gigahertz(ns: i64) {
        // With a 1 GHz base a count is exactly a nanosecond, so the
        // round-trip must be the identity in both modes.
        let b = base();
        for mode in [TimerMode::Oneshot, TimerMode::Periodic] {
            assert_eq!(b.count2nano(mode, b.nano2count(mode, ns)), ns);
        }
    }

    #[quickcheck]
    fn quickcheck_round_trip_within_one_ulp(ns: i32) {
        let b = TimeBase {
            cpu_freq: 1_673_000_000,
            timer_freq: 1_193_180,
        };
        for mode in [TimerMode::Oneshot, TimerMode::Periodic] {
            let rt = b.count2nano(mode, b.nano2count(mode, ns as i64));
            let ulp = match mode {
                TimerMode::Oneshot => NANOS_PER_SEC / b.cpu_freq as i64 + 1,
                TimerMode::Periodic => NANOS_PER_SEC / b.timer_freq as i64 + 1,
            };
            assert!((rt - ns as i64).abs() <= ulp, "{rt} vs {ns} (ulp {ulp})");
        }
    }
}
