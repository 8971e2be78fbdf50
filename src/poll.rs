//! Spin/poll primitives for code waiting on memory-resident flags.
//!
//! These are the synchronization contract between trigger producers and
//! the host proxy: bounded spins that diagnose a stuck wait without
//! killing production runs, and clock-based sleeps for polite backoff.
//!
//! The CUDA ports of these primitives run one spin loop per warp (a
//! single lane spins, the warp rides along); the host rendition below is
//! per-thread but keeps the same budget and wraparound semantics so the
//! two sides stall and diagnose identically.

use std::panic::Location;

/// Device-clock-to-second conversion factor for the target architecture.
pub const CLOCKS_FACTOR: u64 = 2106;

/// Matches the C library clock tick the conversion factor was measured
/// against.
pub const CLOCKS_PER_SEC: u64 = 1_000_000;

/// Raw free-running clock. Cycle counter where available, monotonic
/// nanoseconds otherwise. Only differences are meaningful, and they wrap.
#[inline]
pub fn device_clock() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: RDTSC has no preconditions.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        EPOCH
            .get_or_init(std::time::Instant::now)
            .elapsed()
            .as_nanos() as u64
    }
}

/// Stall the calling thread for approximately `clocks` clock ticks.
///
/// Elapsed time is computed as `now - start` with wrapping subtraction,
/// so a counter wrap mid-sleep does not extend the stall.
#[inline]
pub fn sleep_clocks(clocks: u64) {
    let start = device_clock();
    loop {
        let elapsed = device_clock().wrapping_sub(start);
        if elapsed >= clocks {
            return;
        }
        std::hint::spin_loop();
    }
}

/// Stall for approximately `nsec` nanoseconds, converted to clock ticks
/// via [`CLOCKS_FACTOR`].
#[inline]
pub fn nsleep(nsec: u64) {
    // clocks = factor * CLOCKS_PER_SEC * nsec / 1e9, with the constants
    // folded: factor * nsec / 1000.
    sleep_clocks(CLOCKS_FACTOR.saturating_mul(nsec) / 1_000)
}

/// Budgeted spin tracker behind the jailbreak macros.
///
/// Counts iterations of a spin loop; when the count reaches the budget
/// it emits one diagnostic naming the predicate and the spin site, then
/// lets the loop keep spinning. A stuck spinner means a host-side bug,
/// but only debug builds treat it as fatal.
pub struct SpinGuard {
    predicate: &'static str,
    location: &'static Location<'static>,
    budget: i64,
    spun: i64,
    fired: bool,
}

impl SpinGuard {
    /// `budget < 0` disables the diagnostic.
    #[track_caller]
    pub fn new(predicate: &'static str, budget: i64) -> Self {
        Self {
            predicate,
            location: Location::caller(),
            budget,
            spun: 0,
            fired: false,
        }
    }

    /// Record one spin iteration.
    #[inline]
    pub fn tick(&mut self) {
        if self.budget >= 0 && !self.fired && self.spun == self.budget {
            self.fired = true;
            tracing::warn!(
                predicate = self.predicate,
                location = %self.location,
                budget = self.budget,
                "spin exceeded its budget, continuing to wait"
            );
            debug_assert!(
                false,
                "spin on `{}` at {} exceeded budget {}",
                self.predicate, self.location, self.budget
            );
        }
        self.spun = self.spun.saturating_add(1);
        std::hint::spin_loop();
    }

    /// Whether the jailbreak diagnostic has been emitted.
    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Iterations recorded so far.
    pub fn spun(&self) -> i64 {
        self.spun
    }
}

/// Spin while `cond` holds; diagnose (and keep spinning) once the spin
/// count reaches `max`. Negative `max` disables the diagnostic.
#[macro_export]
macro_rules! poll_maybe_jailbreak {
    ($cond:expr, $max:expr) => {{
        let mut __spin = $crate::poll::SpinGuard::new(stringify!($cond), $max);
        while $cond {
            __spin.tick();
        }
    }};
}

/// Spin while `cond1 && cond2` hold, evaluating `cond1` first and
/// skipping `cond2` when it fails. Useful when `cond1` is the cheap
/// check. Same bounded-stall diagnostic as [`poll_maybe_jailbreak!`].
#[macro_export]
macro_rules! both_poll_maybe_jailbreak {
    ($cond1:expr, $cond2:expr, $max:expr) => {{
        let mut __spin = $crate::poll::SpinGuard::new(
            concat!(stringify!($cond1), " && ", stringify!($cond2)),
            $max,
        );
        loop {
            if !($cond1) {
                break;
            }
            if !($cond2) {
                break;
            }
            __spin.tick();
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_sleep_clocks_returns() {
        // Smoke test: a tiny sleep must terminate.
        sleep_clocks(100);
    }

    #[test]
    fn test_nsleep_zero() {
        nsleep(0);
    }

    #[test]
    fn test_clock_advances() {
        let a = device_clock();
        sleep_clocks(1_000);
        let b = device_clock();
        assert_ne!(a, b);
    }

    #[test]
    fn test_spin_exits_when_condition_clears() {
        let n = AtomicU64::new(3);
        poll_maybe_jailbreak!(n.fetch_sub(1, Ordering::Relaxed) > 1, -1);
        // 3 → 2 → 1: loop exits after the load that returned 1.
        assert_eq!(n.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_negative_budget_never_fires() {
        let mut guard = SpinGuard::new("test", -1);
        for _ in 0..10_000 {
            guard.tick();
        }
        assert!(!guard.fired());
    }

    #[test]
    fn test_jailbreak_fires_at_budget() {
        // In debug builds the diagnostic is fatal; catch it so the test
        // observes both halves of the contract.
        let result = std::panic::catch_unwind(|| {
            let mut guard = SpinGuard::new("stuck", 5);
            for _ in 0..10 {
                guard.tick();
            }
            guard
        });
        if cfg!(debug_assertions) {
            assert!(result.is_err());
        } else {
            let guard = result.unwrap();
            assert!(guard.fired());
            // Release builds keep spinning past the budget.
            assert!(guard.spun() > 5);
        }
    }

    #[test]
    fn test_both_poll_short_circuits_first_condition() {
        // cond1 false on entry: cond2 must never be evaluated.
        let evaluated = AtomicU64::new(0);
        both_poll_maybe_jailbreak!(
            false,
            {
                evaluated.fetch_add(1, Ordering::Relaxed);
                true
            },
            -1
        );
        assert_eq!(evaluated.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_both_poll_exits_on_second_condition() {
        let n = AtomicU64::new(3);
        both_poll_maybe_jailbreak!(true, n.fetch_sub(1, Ordering::Relaxed) > 1, -1);
        assert_eq!(n.load(Ordering::Relaxed), 0);
    }
}
