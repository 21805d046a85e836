//! Appliance-wide health counters.
//!
//! Render-loop and per-source figures live behind atomics so the diagnostic
//! log consumer can read a consistent summary from its own thread while the
//! renderer updates them every frame.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceHealth {
    pub published: u64,
    pub frames_dropped: u64,
    pub update_rate_hz: f32,
    pub stale: bool,
    pub absent: bool,
}

#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub frames_rendered: AtomicU64,
    pub frame_overruns: AtomicU64,
    pub display_errors: AtomicU64,
    sources: DashMap<&'static str, SourceHealth>,
}

impl RuntimeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_frame(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_overrun(&self) {
        self.frame_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_display_error(&self) {
        self.display_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source(&self, name: &'static str, health: SourceHealth) {
        self.sources.insert(name, health);
    }

    pub fn source(&self, name: &str) -> Option<SourceHealth> {
        self.sources.get(name).map(|h| *h)
    }

    /// All sources, name-sorted, for the status bar and periodic log line.
    pub fn sources_sorted(&self) -> Vec<(&'static str, SourceHealth)> {
        let mut out: Vec<(&'static str, SourceHealth)> =
            self.sources.iter().map(|e| (*e.key(), *e.value())).collect();
        out.sort_by_key(|(name, _)| *name);
        out
    }

    /// One-line health summary for the diagnostic log.
    pub fn summary(&self) -> String {
        let frames = self.frames_rendered.load(Ordering::Relaxed);
        let overruns = self.frame_overruns.load(Ordering::Relaxed);
        let srcs: Vec<String> = self
            .sources_sorted()
            .into_iter()
            .map(|(name, h)| {
                if h.absent {
                    format!("{name}=absent")
                } else if h.stale {
                    format!("{name}=stale")
                } else {
                    format!("{name}={:.1}Hz", h.update_rate_hz)
                }
            })
            .collect();
        format!("frames={frames} overruns={overruns} {}", srcs.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_report_sorted_with_state() {
        let c = RuntimeCounters::new();
        c.record_source("tpms", SourceHealth { absent: true, ..Default::default() });
        c.record_source(
            "gps",
            SourceHealth { published: 50, update_rate_hz: 10.0, ..Default::default() },
        );
        c.record_source("obd", SourceHealth { stale: true, ..Default::default() });

        let all = c.sources_sorted();
        assert_eq!(all.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec!["gps", "obd", "tpms"]);

        c.inc_frame();
        c.inc_frame();
        c.inc_overrun();
        let line = c.summary();
        assert!(line.contains("frames=2"));
        assert!(line.contains("overruns=1"));
        assert!(line.contains("gps=10.0Hz"));
        assert!(line.contains("obd=stale"));
        assert!(line.contains("tpms=absent"));
    }
}
