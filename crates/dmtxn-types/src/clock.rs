//! Clocks, shutdown signalling and bounded spinning.
//!
//! All busy-wait loops in the engine (batch slots, one-sided lock words,
//! completion polling, abort backoff) exit on one of three explicit
//! conditions: the awaited predicate holds, a deadline on an injected
//! [`Clock`] passes, or the shared [`ShutdownFlag`] is raised. Time is
//! measured in abstract "cycles"; [`MonotonicClock`] maps one cycle to one
//! nanosecond, tests use [`ManualClock`] to make deadlines deterministic.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Pure spins before the pause helper starts yielding the CPU.
pub const SPIN_BEFORE_YIELD: u32 = 1024;

/// Source of monotonically non-decreasing time in cycles.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

/// Wall-clock backed clock: nanoseconds since construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        // Saturates after ~584 years.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Deterministic clock for tests.
///
/// With a non-zero `step`, every read advances time by `step` so that spin
/// loops waiting on a deadline terminate without a second thread.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    step: u64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            step: 0,
        }
    }

    /// A clock that advances by `step` on every read.
    #[must_use]
    pub const fn auto_advancing(start: u64, step: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            step,
        }
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::AcqRel);
    }

    pub fn set(&self, cycles: u64) {
        self.now.store(cycles, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> u64 {
        if self.step == 0 {
            self.now.load(Ordering::Acquire)
        } else {
            self.now.fetch_add(self.step, Ordering::AcqRel) + self.step
        }
    }
}

/// Process-wide "simulation done" signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Portable pause hint with escalation to `yield_now`.
#[derive(Debug, Default)]
pub struct SpinWait {
    spins: u32,
}

impl SpinWait {
    #[must_use]
    pub const fn new() -> Self {
        Self { spins: 0 }
    }

    #[inline]
    pub fn pause(&mut self) {
        if self.spins < SPIN_BEFORE_YIELD {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
    }
}

/// Why [`spin_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    Satisfied,
    DeadlineExpired,
    Shutdown,
}

/// Spin until `cond` holds, `deadline` passes on `clock`, or shutdown.
///
/// `cond` is evaluated before the exit conditions, so a predicate that is
/// already true wins even when the deadline is in the past.
pub fn spin_until(
    clock: &dyn Clock,
    deadline: Option<u64>,
    shutdown: &ShutdownFlag,
    mut cond: impl FnMut() -> bool,
) -> SpinOutcome {
    let mut spin = SpinWait::new();
    loop {
        if cond() {
            return SpinOutcome::Satisfied;
        }
        if deadline.is_some_and(|d| clock.now() >= d) {
            return SpinOutcome::DeadlineExpired;
        }
        if shutdown.is_requested() {
            return SpinOutcome::Shutdown;
        }
        spin.pause();
    }
}

/// Burn `cycles` of clock time (abort backoff). Returns early on shutdown.
pub fn pause_cycles(clock: &dyn Clock, cycles: u64, shutdown: &ShutdownFlag) {
    if cycles == 0 {
        return;
    }
    let deadline = clock.now().saturating_add(cycles);
    let _ = spin_until(clock, Some(deadline), shutdown, || false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_steps() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);

        let auto = ManualClock::auto_advancing(0, 5);
        assert_eq!(auto.now(), 5);
        assert_eq!(auto.now(), 10);
    }

    #[test]
    fn spin_until_deadline_with_manual_clock() {
        let clock = ManualClock::auto_advancing(0, 10);
        let shutdown = ShutdownFlag::new();
        let outcome = spin_until(&clock, Some(100), &shutdown, || false);
        assert_eq!(outcome, SpinOutcome::DeadlineExpired);
        assert!(clock.now() >= 100);
    }

    #[test]
    fn spin_until_prefers_satisfied_condition() {
        let clock = ManualClock::new(1_000);
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        assert_eq!(
            spin_until(&clock, Some(0), &shutdown, || true),
            SpinOutcome::Satisfied
        );
    }

    #[test]
    fn spin_until_observes_shutdown() {
        let clock = ManualClock::new(0);
        let shutdown = ShutdownFlag::new();
        let remote = shutdown.clone();
        let mut calls = 0;
        let outcome = spin_until(&clock, None, &shutdown, || {
            calls += 1;
            if calls == 3 {
                remote.request();
            }
            false
        });
        assert_eq!(outcome, SpinOutcome::Shutdown);
        assert_eq!(calls, 3);
    }

    #[test]
    fn pause_cycles_advances_clock() {
        let clock = ManualClock::auto_advancing(0, 7);
        pause_cycles(&clock, 70, &ShutdownFlag::new());
        assert!(clock.now() >= 70);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
