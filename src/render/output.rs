//! Secondary output seams: display backend, shift strip, OLED, audio.
//!
//! Real implementations (framebuffer, LED driver, TTS engine) live with the
//! platform integration; the appliance core only talks to these traits.

use super::model::DisplayFrame;
use super::RenderError;

pub trait DisplayBackend {
    fn present(&mut self, frame: &DisplayFrame) -> Result<(), RenderError>;
}

pub trait AudioSink {
    fn speak(&mut self, text: &str);
}

/// RPM shift strip: fraction of the warn..shift band, plus an over-limit
/// flash flag.
pub trait ShiftStrip {
    fn set_level(&mut self, fraction: f32, over_limit: bool);
}

pub trait OledPanel {
    fn show(&mut self, line1: &str, line2: &str);
}

pub struct NullAudio;

impl AudioSink for NullAudio {
    fn speak(&mut self, _text: &str) {}
}

pub struct NullStrip;

impl ShiftStrip for NullStrip {
    fn set_level(&mut self, _fraction: f32, _over_limit: bool) {}
}

pub struct NullOled;

impl OledPanel for NullOled {
    fn show(&mut self, _line1: &str, _line2: &str) {}
}

/// Stdout backend for bench-top runs without a panel attached: prints a
/// one-line summary at most once a second instead of drawing pixels.
pub struct ConsoleDisplay {
    last_print: Option<std::time::Instant>,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self { last_print: None }
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayBackend for ConsoleDisplay {
    fn present(&mut self, frame: &DisplayFrame) -> Result<(), RenderError> {
        let now = std::time::Instant::now();
        if self
            .last_print
            .map_or(false, |t| now.duration_since(t) < std::time::Duration::from_secs(1))
        {
            return Ok(());
        }
        self.last_print = Some(now);
        let badges: Vec<String> = frame
            .status
            .sources
            .iter()
            .map(|(name, badge)| format!("{name}:{badge:?}"))
            .collect();
        println!(
            "[{:?}] fix={} sats={} {}{}",
            frame.page,
            frame.status.gps_fix,
            frame.status.sats,
            badges.join(" "),
            frame
                .status
                .banner
                .as_deref()
                .map(|b| format!(" | {b}"))
                .unwrap_or_default()
        );
        Ok(())
    }
}

/// Records presented frames; test backend and headless smoke-run target.
#[derive(Default)]
pub struct HeadlessDisplay {
    pub frames: Vec<DisplayFrame>,
    /// Scripted failures: error on these 0-based frame indices.
    pub fail_on: Vec<usize>,
    pub(crate) presented: usize,
}

impl DisplayBackend for HeadlessDisplay {
    fn present(&mut self, frame: &DisplayFrame) -> Result<(), RenderError> {
        let idx = self.presented;
        self.presented += 1;
        if self.fail_on.contains(&idx) {
            return Err(RenderError::Display(format!("injected failure at frame {idx}")));
        }
        self.frames.push(frame.clone());
        Ok(())
    }
}

/// Computes the shift-strip drive from current RPM and the thresholds.
pub fn shift_level(rpm: f64, warn_rpm: u32, shift_rpm: u32) -> (f32, bool) {
    let warn = warn_rpm as f64;
    let shift = shift_rpm as f64;
    if shift <= warn {
        return (0.0, rpm >= shift);
    }
    let frac = ((rpm - warn) / (shift - warn)).clamp(0.0, 1.0) as f32;
    (frac, rpm >= shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_level_maps_band() {
        assert_eq!(shift_level(5_000.0, 6_200, 6_800), (0.0, false));
        let (frac, over) = shift_level(6_500.0, 6_200, 6_800);
        assert!((frac - 0.5).abs() < 1e-6);
        assert!(!over);
        assert_eq!(shift_level(7_000.0, 6_200, 6_800), (1.0, true));
    }

    #[test]
    fn degenerate_thresholds_do_not_divide_by_zero() {
        let (frac, over) = shift_level(7_000.0, 6_800, 6_800);
        assert_eq!(frac, 0.0);
        assert!(over);
    }
}
