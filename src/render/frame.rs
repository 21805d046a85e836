//! Frame pacing and budget accounting.

use std::time::{Duration, Instant};

use log::warn;
use spin_sleep::{SpinSleeper, SpinStrategy};

/// Minimum yield per frame so the loop never busy-spins a core.
const MIN_YIELD: Duration = Duration::from_millis(1);

/// Fixed-rate tick source for the render loop.
pub struct FrameClock {
    period: Duration,
    sleeper: SpinSleeper,
    next_deadline: Instant,
}

impl FrameClock {
    pub fn new(fps_target: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / fps_target.max(1) as f64);
        Self {
            period,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            next_deadline: Instant::now() + period,
        }
    }

    /// Sleeps until the next tick (always at least the minimum yield) and
    /// returns the tick instant. A late wake skips ahead rather than
    /// accumulating drift.
    pub fn wait_next(&mut self) -> Instant {
        let now = Instant::now();
        if now < self.next_deadline {
            self.sleeper.sleep((self.next_deadline - now).max(MIN_YIELD));
        } else {
            self.sleeper.sleep(MIN_YIELD);
            // Missed one or more ticks; realign the schedule.
            while self.next_deadline <= now {
                self.next_deadline += self.period;
            }
        }
        let tick = Instant::now();
        self.next_deadline += self.period;
        tick
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Per-section stopwatch for one frame.
#[derive(Debug, Default)]
pub struct SectionTimings {
    sections: Vec<(&'static str, Duration)>,
}

impl SectionTimings {
    pub fn time<R>(&mut self, name: &'static str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.sections.push((name, start.elapsed()));
        out
    }

    pub fn total(&self) -> Duration {
        self.sections.iter().map(|(_, d)| *d).sum()
    }

    pub fn report(&self) -> String {
        self.sections
            .iter()
            .map(|(name, d)| format!("{name}={:.2}ms", d.as_secs_f64() * 1e3))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Watches frame times against the render budget; logs a per-section dump
/// after the configured number of consecutive overruns.
pub struct BudgetTracker {
    budget: Duration,
    warn_after: u32,
    consecutive_over: u32,
}

impl BudgetTracker {
    pub fn new(budget: Duration, warn_after: u32) -> Self {
        Self { budget, warn_after, consecutive_over: 0 }
    }

    /// Records one frame; returns `true` when the overrun warning fired.
    pub fn record(&mut self, timings: &SectionTimings) -> bool {
        if timings.total() <= self.budget {
            self.consecutive_over = 0;
            return false;
        }
        self.consecutive_over += 1;
        if self.consecutive_over == self.warn_after {
            warn!(
                "{} consecutive frames over {:.0}ms budget: {}",
                self.consecutive_over,
                self.budget.as_secs_f64() * 1e3,
                timings.report()
            );
            return true;
        }
        false
    }

    pub fn consecutive_over(&self) -> u32 {
        self.consecutive_over
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings(ms: u64) -> SectionTimings {
        let mut t = SectionTimings::default();
        t.sections.push(("draw", Duration::from_millis(ms)));
        t
    }

    #[test]
    fn clock_paces_close_to_target() {
        let mut clock = FrameClock::new(100); // 10 ms period
        let start = Instant::now();
        for _ in 0..10 {
            clock.wait_next();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[test]
    fn budget_warns_only_after_streak() {
        let mut b = BudgetTracker::new(Duration::from_millis(12), 5);
        for _ in 0..4 {
            assert!(!b.record(&timings(20)));
        }
        assert!(b.record(&timings(20)), "fifth consecutive overrun warns");
        assert!(!b.record(&timings(20)), "warning fires once per streak");
    }

    #[test]
    fn in_budget_frame_resets_streak() {
        let mut b = BudgetTracker::new(Duration::from_millis(12), 5);
        for _ in 0..4 {
            b.record(&timings(20));
        }
        b.record(&timings(5));
        assert_eq!(b.consecutive_over(), 0);
    }

    #[test]
    fn section_report_lists_each_phase() {
        let mut t = SectionTimings::default();
        t.time("poll", || std::thread::sleep(Duration::from_millis(1)));
        t.time("draw", || {});
        let report = t.report();
        assert!(report.contains("poll="));
        assert!(report.contains("draw="));
        assert!(t.total() >= Duration::from_millis(1));
    }
}
