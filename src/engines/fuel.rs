//! Fuel tracking: smoothed level, per-lap consumption and range estimates.
//!
//! OBD fuel-level readings slosh badly under cornering, so the tracker runs
//! them through a rolling median by default. Per-lap consumption comes from
//! the smoothed level at lap boundaries; estimates stay invalid until at
//! least one lap is complete and enough distance has accumulated.

use log::info;

use crate::config::{FuelConfig, FuelSmoothing};
use crate::utils::filter::{SampleWindow, WindowKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuelStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuelEstimate {
    pub laps_remaining: u32,
    pub avg_pct_per_lap: f64,
}

pub struct FuelTracker {
    cfg: FuelConfig,
    window: SampleWindow,
    /// Smoothed level at the start of the current lap.
    lap_baseline: Option<f64>,
    per_lap_used: Vec<f64>,
    session_start_level: Option<f64>,
    cumulative_km: f64,
    laps_completed: u32,
    refuels_detected: u32,
}

impl FuelTracker {
    pub fn new(cfg: FuelConfig) -> Self {
        let window = SampleWindow::new(cfg.smoothing_window);
        Self {
            cfg,
            window,
            lap_baseline: None,
            per_lap_used: Vec::new(),
            session_start_level: None,
            cumulative_km: 0.0,
            laps_completed: 0,
            refuels_detected: 0,
        }
    }

    fn kind(&self) -> WindowKind {
        match self.cfg.smoothing {
            FuelSmoothing::Median => WindowKind::Median,
            FuelSmoothing::Mean => WindowKind::Mean,
        }
    }

    pub fn smoothed_level_pct(&self) -> Option<f64> {
        self.window.smoothed(self.kind())
    }

    /// Feeds one raw OBD fuel-level sample.
    pub fn feed_level(&mut self, level_pct: f64) {
        if !(0.0..=100.0).contains(&level_pct) {
            return;
        }

        // Refuel gate: a raw sample jumping above the smoothed level by more
        // than the configured threshold restarts the session. The threshold
        // has no shipped default; without one, detection is off.
        if let (Some(threshold), Some(smoothed)) =
            (self.cfg.refuel_threshold_pct, self.smoothed_level_pct())
        {
            if level_pct - smoothed > threshold {
                info!(
                    "refuel detected ({smoothed:.1}% -> {level_pct:.1}%); session counters reset"
                );
                self.refuels_detected += 1;
                self.window.clear();
                self.per_lap_used.clear();
                self.laps_completed = 0;
                self.cumulative_km = 0.0;
                self.lap_baseline = None;
                self.session_start_level = None;
                return; // the rise sample itself is discarded
            }
        }

        self.window.push(level_pct);
        let smoothed = self.smoothed_level_pct();
        if self.session_start_level.is_none() {
            self.session_start_level = smoothed;
        }
        if self.lap_baseline.is_none() {
            self.lap_baseline = smoothed;
        }
    }

    /// Integrated GPS distance since the previous fix.
    pub fn feed_distance_km(&mut self, km: f64) {
        if km.is_finite() && km >= 0.0 {
            self.cumulative_km += km;
        }
    }

    /// Called on each lap completion event.
    pub fn on_lap_complete(&mut self) {
        let Some(now) = self.smoothed_level_pct() else {
            return;
        };
        if let Some(baseline) = self.lap_baseline {
            let used = (baseline - now).max(0.0);
            self.per_lap_used.push(used);
            self.laps_completed += 1;
        }
        self.lap_baseline = Some(now);
    }

    pub fn avg_pct_per_lap(&self) -> Option<f64> {
        if self.per_lap_used.is_empty() {
            return None;
        }
        Some(self.per_lap_used.iter().sum::<f64>() / self.per_lap_used.len() as f64)
    }

    pub fn session_used_pct(&self) -> Option<f64> {
        let (start, now) = (self.session_start_level?, self.smoothed_level_pct()?);
        Some((start - now).max(0.0))
    }

    pub fn consumption_pct_per_km(&self) -> Option<f64> {
        if self.cumulative_km < 1e-6 {
            return None;
        }
        Some(self.session_used_pct()? / self.cumulative_km)
    }

    /// Laps remaining on the current tank; `None` until the estimate is
    /// trustworthy (one lap done and enough distance covered).
    pub fn estimate(&self) -> Option<FuelEstimate> {
        if self.laps_completed < 1 || self.cumulative_km < self.cfg.min_distance_for_estimate_km {
            return None;
        }
        let avg = self.avg_pct_per_lap()?;
        if avg <= 1e-9 {
            return None;
        }
        let level = self.smoothed_level_pct()?;
        Some(FuelEstimate {
            laps_remaining: (level / avg).floor() as u32,
            avg_pct_per_lap: avg,
        })
    }

    /// Distance range when no track is loaded (km on remaining fuel).
    pub fn range_km(&self) -> Option<f64> {
        if self.cumulative_km < self.cfg.min_distance_for_estimate_km {
            return None;
        }
        let per_km = self.consumption_pct_per_km()?;
        if per_km <= 1e-9 {
            return None;
        }
        Some(self.smoothed_level_pct()? / per_km)
    }

    pub fn status(&self) -> FuelStatus {
        match self.smoothed_level_pct() {
            Some(l) if l <= self.cfg.critical_threshold_pct => FuelStatus::Critical,
            Some(l) if l <= self.cfg.warning_threshold_pct => FuelStatus::Warning,
            _ => FuelStatus::Ok,
        }
    }

    pub fn refuels_detected(&self) -> u32 {
        self.refuels_detected
    }

    pub fn laps_completed(&self) -> u32 {
        self.laps_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(window: usize, refuel: Option<f64>) -> FuelConfig {
        FuelConfig {
            smoothing_window: window,
            smoothing: FuelSmoothing::Median,
            refuel_threshold_pct: refuel,
            min_distance_for_estimate_km: 5.0,
            warning_threshold_pct: 15.0,
            critical_threshold_pct: 7.0,
        }
    }

    fn settle(t: &mut FuelTracker, level: f64, n: usize) {
        for _ in 0..n {
            t.feed_level(level);
        }
    }

    #[test]
    fn two_laps_give_expected_average_and_estimate() {
        let mut t = FuelTracker::new(cfg(5, None));

        settle(&mut t, 100.0, 5);
        t.feed_distance_km(6.0);
        settle(&mut t, 95.0, 5);
        t.on_lap_complete(); // 5 % used

        t.feed_distance_km(6.0);
        settle(&mut t, 89.0, 5);
        t.on_lap_complete(); // 6 % used

        let avg = t.avg_pct_per_lap().unwrap();
        assert!((avg - 5.5).abs() < 1e-9, "avg {avg}");

        let est = t.estimate().expect("12 km >= 5 km makes the estimate valid");
        assert_eq!(est.laps_remaining, 16, "floor(89 / 5.5)");
    }

    #[test]
    fn estimate_invalid_below_distance_gate() {
        let mut t = FuelTracker::new(cfg(5, None));
        settle(&mut t, 100.0, 5);
        t.feed_distance_km(3.0);
        settle(&mut t, 95.0, 5);
        t.on_lap_complete();
        assert!(t.estimate().is_none(), "3 km < 5 km gate");
    }

    #[test]
    fn estimate_invalid_without_completed_lap() {
        let mut t = FuelTracker::new(cfg(5, None));
        settle(&mut t, 80.0, 5);
        t.feed_distance_km(20.0);
        assert!(t.estimate().is_none());
    }

    #[test]
    fn refuel_resets_session_and_discards_rise_sample() {
        let mut t = FuelTracker::new(cfg(5, Some(10.0)));

        settle(&mut t, 100.0, 5);
        t.feed_distance_km(10.0);
        settle(&mut t, 20.0, 8);
        t.on_lap_complete();
        assert!(t.avg_pct_per_lap().unwrap() > 0.0);

        // The jump to 80 is the refuel.
        t.feed_level(80.0);
        assert_eq!(t.refuels_detected(), 1);
        assert!(t.avg_pct_per_lap().is_none(), "per-lap history reset");
        assert_eq!(t.laps_completed(), 0);
        assert!(t.smoothed_level_pct().is_none(), "rise sample not in window");

        // Fresh samples establish the new level without negative consumption.
        settle(&mut t, 80.0, 5);
        assert_eq!(t.smoothed_level_pct(), Some(80.0));
        t.on_lap_complete();
        assert!(t.per_lap_used.iter().all(|u| *u >= 0.0));
    }

    #[test]
    fn median_ignores_slosh_outlier() {
        let mut t = FuelTracker::new(cfg(5, None));
        settle(&mut t, 50.0, 4);
        t.feed_level(95.0); // slosh spike under threshold-less config
        assert_eq!(t.smoothed_level_pct(), Some(50.0));
    }

    #[test]
    fn same_stream_twice_is_identical() {
        let run = || {
            let mut t = FuelTracker::new(cfg(7, Some(15.0)));
            for i in 0..200 {
                let level = 100.0 - (i as f64) * 0.3 + if i % 13 == 0 { 4.0 } else { 0.0 };
                t.feed_level(level.clamp(0.0, 100.0));
                t.feed_distance_km(0.05);
                if i % 40 == 39 {
                    t.on_lap_complete();
                }
            }
            (
                t.smoothed_level_pct(),
                t.avg_pct_per_lap(),
                t.estimate(),
                t.session_used_pct(),
                t.laps_completed(),
            )
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn status_follows_thresholds() {
        let mut t = FuelTracker::new(cfg(3, None));
        settle(&mut t, 50.0, 3);
        assert_eq!(t.status(), FuelStatus::Ok);
        settle(&mut t, 12.0, 3);
        assert_eq!(t.status(), FuelStatus::Warning);
        settle(&mut t, 5.0, 3);
        assert_eq!(t.status(), FuelStatus::Critical);
    }

    #[test]
    fn consumption_clamped_non_negative() {
        let mut t = FuelTracker::new(cfg(3, None));
        settle(&mut t, 50.0, 3);
        t.on_lap_complete();
        // Level noise upward without a refuel threshold configured.
        settle(&mut t, 53.0, 3);
        t.on_lap_complete();
        assert!(t.per_lap_used.iter().all(|u| *u >= 0.0));
    }

    #[test]
    fn range_estimate_over_distance() {
        let mut t = FuelTracker::new(cfg(3, None));
        settle(&mut t, 100.0, 3);
        t.feed_distance_km(10.0);
        settle(&mut t, 90.0, 3);
        // 10 % over 10 km -> 1 %/km -> 90 km left.
        let range = t.range_km().unwrap();
        assert!((range - 90.0).abs() < 1e-6, "range {range}");
    }
}
