//! Bounded sample windows with median/mean readouts.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Rejects single-sample outliers (fuel slosh, OBD glitches).
    Median,
    Mean,
}

/// Fixed-capacity rolling window over `f64` samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    cap: usize,
    values: VecDeque<f64>,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), values: VecDeque::with_capacity(cap.max(1)) }
    }

    pub fn push(&mut self, v: f64) {
        if self.values.len() >= self.cap {
            self.values.pop_front();
        }
        self.values.push_back(v);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Drops the most recent sample, e.g. a detected refuel step.
    pub fn pop_newest(&mut self) -> Option<f64> {
        self.values.pop_back()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn median(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn smoothed(&self, kind: WindowKind) -> Option<f64> {
        match kind {
            WindowKind::Median => self.median(),
            WindowKind::Mean => self.mean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_rejects_outlier() {
        let mut w = SampleWindow::new(5);
        for v in [50.0, 50.2, 49.8, 50.1, 90.0] {
            w.push(v);
        }
        assert!((w.median().unwrap() - 50.1).abs() < 1e-9);
        assert!(w.mean().unwrap() > 55.0);
    }

    #[test]
    fn window_is_bounded() {
        let mut w = SampleWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.mean(), Some(3.0));
    }

    #[test]
    fn even_window_median_averages_middle_pair() {
        let mut w = SampleWindow::new(4);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.median(), Some(2.5));
    }

    #[test]
    fn empty_window_reads_none() {
        let w = SampleWindow::new(4);
        assert_eq!(w.median(), None);
        assert_eq!(w.mean(), None);
    }
}
