//! Pit-lane state machine, stop countdown and speed monitoring.

use std::time::{Duration, Instant};

use log::info;

use crate::config::{PitConfig, PitMode};
use crate::geo::{LatLon, Segment};
use crate::handlers::gps::GpsFix;

/// Driver-marked pit entry/exit lines for one track.
#[derive(Debug, Clone, PartialEq)]
pub struct PitWaypoint {
    pub track_name: String,
    pub entry_line: Segment,
    pub exit_line: Segment,
    pub mode: PitMode,
    pub speed_limit_kmh: f64,
    pub min_stop: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitState {
    OnTrack,
    InPitLane,
    Stationary,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PitEvent {
    EnteredPitLane,
    BecameStationary,
    ResumedMoving,
    LeftPitLane,
    SpeedWarning { speed_kmh: f64 },
    SpeedViolation { speed_kmh: f64 },
    /// Minimum stop satisfied; fires exactly once per stop.
    Go,
}

/// Live pit stop bookkeeping, reset on each entry-line crossing.
#[derive(Debug, Clone)]
pub struct PitSession {
    pub state: PitState,
    pub entry_ts: Option<Instant>,
    pub exit_ts: Option<Instant>,
    pub stationary_ts: Option<Instant>,
    pub elapsed: Duration,
    pub peak_speed_kmh: f64,
    pub violations: u32,
}

impl Default for PitSession {
    fn default() -> Self {
        Self {
            state: PitState::OnTrack,
            entry_ts: None,
            exit_ts: None,
            stationary_ts: None,
            elapsed: Duration::ZERO,
            peak_speed_kmh: 0.0,
            violations: 0,
        }
    }
}

/// Re-arm window after a pit line fires, matching the lap timer's
/// double-cross suppression.
const LINE_REARM_M: f64 = 15.0;
/// Dwell above the stationary speed before Stationary is left.
const RESUME_DWELL: Duration = Duration::from_millis(500);

pub struct PitTimer {
    cfg: PitConfig,
    waypoint: Option<PitWaypoint>,
    session: PitSession,
    last_fix: Option<GpsFix>,
    entry_armed: bool,
    exit_armed: bool,
    slow_since: Option<Instant>,
    fast_since: Option<Instant>,
    /// Accumulated stationary time from previous stationary phases this stop.
    stationary_accum: Duration,
    go_fired: bool,
    over_limit: bool,
}

impl PitTimer {
    pub fn new(cfg: PitConfig) -> Self {
        Self {
            cfg,
            waypoint: None,
            session: PitSession::default(),
            last_fix: None,
            entry_armed: true,
            exit_armed: true,
            slow_since: None,
            fast_since: None,
            stationary_accum: Duration::ZERO,
            go_fired: false,
            over_limit: false,
        }
    }

    pub fn set_waypoint(&mut self, wp: Option<PitWaypoint>) {
        if let Some(ref wp) = wp {
            info!("pit waypoint loaded for {}", wp.track_name);
        }
        self.waypoint = wp;
        self.session = PitSession::default();
        self.entry_armed = true;
        self.exit_armed = true;
    }

    pub fn waypoint(&self) -> Option<&PitWaypoint> {
        self.waypoint.as_ref()
    }

    pub fn session(&self) -> &PitSession {
        &self.session
    }

    pub fn state(&self) -> PitState {
        self.session.state
    }

    /// Marks the pit entry line perpendicular to the current heading.
    pub fn mark_entry(&mut self, track_name: &str, pos: LatLon, heading_deg: f64, line_width_m: f64) {
        let line = Segment::perpendicular_at(pos, heading_deg, line_width_m);
        let wp = self.waypoint.get_or_insert_with(|| PitWaypoint {
            track_name: track_name.to_string(),
            entry_line: line,
            exit_line: line,
            mode: self.cfg.mode,
            speed_limit_kmh: self.cfg.speed_limit_kmh,
            min_stop: self.cfg.min_stop,
        });
        wp.entry_line = line;
        wp.track_name = track_name.to_string();
    }

    /// Marks the pit exit line perpendicular to the current heading.
    pub fn mark_exit(&mut self, track_name: &str, pos: LatLon, heading_deg: f64, line_width_m: f64) {
        let line = Segment::perpendicular_at(pos, heading_deg, line_width_m);
        let wp = self.waypoint.get_or_insert_with(|| PitWaypoint {
            track_name: track_name.to_string(),
            entry_line: line,
            exit_line: line,
            mode: self.cfg.mode,
            speed_limit_kmh: self.cfg.speed_limit_kmh,
            min_stop: self.cfg.min_stop,
        });
        wp.exit_line = line;
        wp.track_name = track_name.to_string();
    }

    /// Flips between entrance-to-exit and stationary-only timing. Defined in
    /// every state; a stop in progress keeps its accumulated time.
    pub fn toggle_mode(&mut self) -> PitMode {
        self.cfg.mode = match self.cfg.mode {
            PitMode::EntranceToExit => PitMode::StationaryOnly,
            PitMode::StationaryOnly => PitMode::EntranceToExit,
        };
        if let Some(ref mut wp) = self.waypoint {
            wp.mode = self.cfg.mode;
        }
        self.cfg.mode
    }

    pub fn mode(&self) -> PitMode {
        self.cfg.mode
    }

    /// Stop countdown while waiting out the minimum stop; `None` when no
    /// countdown is active.
    pub fn countdown_remaining(&self) -> Option<Duration> {
        if self.cfg.min_stop.is_zero() {
            return None;
        }
        let counting = match self.cfg.mode {
            PitMode::StationaryOnly => self.session.state == PitState::Stationary,
            PitMode::EntranceToExit => {
                matches!(self.session.state, PitState::InPitLane | PitState::Stationary)
            }
        };
        if !counting {
            return None;
        }
        Some(self.cfg.min_stop.saturating_sub(self.session.elapsed))
    }

    /// Feeds one GPS fix through the state machine.
    pub fn update(&mut self, fix: &GpsFix) -> Vec<PitEvent> {
        let mut events = Vec::new();
        let Some(wp) = self.waypoint.clone() else {
            self.last_fix = Some(fix.clone());
            return events;
        };
        let Some(prev) = self.last_fix.replace(fix.clone()) else {
            return events;
        };

        let pos = LatLon::new(fix.lat, fix.lon);
        let prev_pos = LatLon::new(prev.lat, prev.lon);

        // Re-arm lines once the car is clear of them.
        if !self.entry_armed && wp.entry_line.distance_to_m(&pos) > LINE_REARM_M {
            self.entry_armed = true;
        }
        if !self.exit_armed && wp.exit_line.distance_to_m(&pos) > LINE_REARM_M {
            self.exit_armed = true;
        }

        let crossed_entry =
            self.entry_armed && wp.entry_line.crossing(&prev_pos, &pos).is_some();
        let crossed_exit = self.exit_armed && wp.exit_line.crossing(&prev_pos, &pos).is_some();

        match self.session.state {
            PitState::OnTrack => {
                if crossed_entry {
                    self.entry_armed = false;
                    self.session = PitSession {
                        state: PitState::InPitLane,
                        entry_ts: Some(fix.ts),
                        ..PitSession::default()
                    };
                    self.stationary_accum = Duration::ZERO;
                    self.slow_since = None;
                    self.fast_since = None;
                    self.go_fired = false;
                    self.over_limit = false;
                    events.push(PitEvent::EnteredPitLane);
                }
            }
            PitState::InPitLane => {
                self.monitor_speed(fix, &wp, &mut events);
                self.advance_elapsed(fix);

                if crossed_exit {
                    self.exit_armed = false;
                    self.session.exit_ts = Some(fix.ts);
                    self.session.state = PitState::OnTrack;
                    events.push(PitEvent::LeftPitLane);
                } else {
                    // Stationary detection: below threshold for the dwell.
                    if fix.speed_kmh < self.cfg.stationary_speed_kmh {
                        let since = *self.slow_since.get_or_insert(fix.ts);
                        if fix.ts.duration_since(since) >= self.cfg.stationary_duration {
                            self.session.state = PitState::Stationary;
                            self.session.stationary_ts = Some(fix.ts);
                            self.fast_since = None;
                            events.push(PitEvent::BecameStationary);
                        }
                    } else {
                        self.slow_since = None;
                    }
                }
                self.check_countdown(&mut events);
            }
            PitState::Stationary => {
                self.monitor_speed(fix, &wp, &mut events);
                self.advance_elapsed(fix);
                self.check_countdown(&mut events);

                if crossed_exit {
                    self.exit_armed = false;
                    self.seal_stationary(fix.ts);
                    self.session.exit_ts = Some(fix.ts);
                    self.session.state = PitState::OnTrack;
                    events.push(PitEvent::LeftPitLane);
                } else if fix.speed_kmh >= self.cfg.stationary_speed_kmh {
                    let since = *self.fast_since.get_or_insert(fix.ts);
                    if fix.ts.duration_since(since) > RESUME_DWELL {
                        // The stop ended when movement began, not when the
                        // dwell confirmed it.
                        self.seal_stationary(since);
                        if self.cfg.mode == PitMode::StationaryOnly {
                            self.session.elapsed = self.stationary_accum;
                        }
                        self.session.state = PitState::InPitLane;
                        self.slow_since = None;
                        events.push(PitEvent::ResumedMoving);
                    }
                } else {
                    self.fast_since = None;
                }
            }
        }

        events
    }

    fn seal_stationary(&mut self, now: Instant) {
        if let Some(start) = self.session.stationary_ts.take() {
            self.stationary_accum += now.duration_since(start);
        }
    }

    /// Recomputes the mode-dependent elapsed timer.
    fn advance_elapsed(&mut self, fix: &GpsFix) {
        self.session.elapsed = match self.cfg.mode {
            PitMode::EntranceToExit => self
                .session
                .entry_ts
                .map(|t| fix.ts.duration_since(t))
                .unwrap_or_default(),
            PitMode::StationaryOnly => {
                let live = self
                    .session
                    .stationary_ts
                    .filter(|_| self.session.state == PitState::Stationary)
                    .map(|t| fix.ts.duration_since(t))
                    .unwrap_or_default();
                self.stationary_accum + live
            }
        };
    }

    fn check_countdown(&mut self, events: &mut Vec<PitEvent>) {
        if self.go_fired || self.cfg.min_stop.is_zero() {
            return;
        }
        if let Some(remaining) = self.countdown_remaining() {
            if remaining.is_zero() {
                self.go_fired = true;
                events.push(PitEvent::Go);
            }
        }
    }

    fn monitor_speed(&mut self, fix: &GpsFix, wp: &PitWaypoint, events: &mut Vec<PitEvent>) {
        if fix.speed_kmh > self.session.peak_speed_kmh {
            self.session.peak_speed_kmh = fix.speed_kmh;
        }
        if fix.speed_kmh > wp.speed_limit_kmh {
            if !self.over_limit {
                self.over_limit = true;
                self.session.violations += 1;
                events.push(PitEvent::SpeedViolation { speed_kmh: fix.speed_kmh });
            }
        } else {
            self.over_limit = false;
            if fix.speed_kmh > wp.speed_limit_kmh - self.cfg.warning_margin_kmh {
                events.push(PitEvent::SpeedWarning { speed_kmh: fix.speed_kmh });
            }
        }
    }
}
